//! Post office: the delivery engine's dispatcher
//!
//! Turns inbound events of one connection into changes of the topic matcher,
//! session registry and retained store, and into outbound packets. Each
//! connection's events are handled sequentially; connections run in parallel.
//!
//! Handlers are split by packet family:
//! - `connect`: CONNECT validation, authentication and session binding
//! - `subscribe`: SUBSCRIBE / UNSUBSCRIBE and retained delivery
//! - `publish`: inbound PUBLISH, PUBREL and the fan-out path
//! - `qos`: outbound acknowledgements (PUBACK, PUBREC, PUBCOMP)
//! - `disconnect`: DISCONNECT, connection loss and the will message

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;


use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::broker::writer::PacketWriter;
use crate::persistence::{LoadedData, PersistenceManager};
use crate::protocol::{Packet, ProtocolError, QoS};
use crate::retained::{RetainedMessage, RetainedStore};
use crate::session::{Session, SessionLimits, SessionRegistry};
use crate::topic::TopicMatcher;

/// Event delivered by the transport for one connection
#[derive(Debug)]
pub enum InboundEvent {
    /// A decoded control packet
    Packet(Packet),
    /// The network connection ended (EOF, I/O error, timeout, or after `Flow::Close`)
    ConnectionLost,
}

/// What the transport should do after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Protocol state of a connection
pub enum ConnectionState {
    /// Waiting for CONNECT
    Connecting,
    /// CONNECT accepted and bound to a session
    Connected {
        client_id: Arc<str>,
        session: Arc<RwLock<Session>>,
    },
    /// DISCONNECT received or the connection was lost
    Disconnected,
}

/// Per-connection context owned by the transport task
pub struct ClientConnection {
    pub id: u64,
    pub writer: Arc<dyn PacketWriter>,
    pub state: ConnectionState,
}

impl ClientConnection {
    pub fn new(id: u64, writer: Arc<dyn PacketWriter>) -> Self {
        Self {
            id,
            writer,
            state: ConnectionState::Connecting,
        }
    }

    /// Client id once connected
    pub fn client_id(&self) -> Option<&Arc<str>> {
        match &self.state {
            ConnectionState::Connected { client_id, .. } => Some(client_id),
            _ => None,
        }
    }

    /// Reply on this connection; a failed write is only logged
    pub(crate) fn reply(&self, packet: Packet) {
        if let Err(e) = self.writer.send(packet) {
            debug!(connection_id = self.id, error = %e, "reply not sent");
        }
    }
}

/// Post office configuration
#[derive(Debug, Clone)]
pub struct PostOfficeConfig {
    /// Highest QoS granted or accepted
    pub max_qos: QoS,
    /// Generate ids for clean-session clients with an empty client id
    pub allow_zero_byte_client_id: bool,
    /// Maximum client id length (0 = unlimited)
    pub max_client_id_len: usize,
    pub session_limits: SessionLimits,
}

impl Default for PostOfficeConfig {
    fn default() -> Self {
        Self {
            max_qos: QoS::ExactlyOnce,
            allow_zero_byte_client_id: true,
            max_client_id_len: 0,
            session_limits: SessionLimits::default(),
        }
    }
}

/// The dispatcher tying matcher, registry and retained store together
pub struct PostOffice {
    config: PostOfficeConfig,
    matcher: Arc<TopicMatcher>,
    registry: Arc<SessionRegistry>,
    retained: Arc<RetainedStore>,
    authenticator: Arc<dyn Authenticator>,
    persistence: Option<Arc<PersistenceManager>>,
}

impl PostOffice {
    pub fn new(
        config: PostOfficeConfig,
        authenticator: Arc<dyn Authenticator>,
        persistence: Option<Arc<PersistenceManager>>,
    ) -> Self {
        let matcher = Arc::new(TopicMatcher::new());
        let registry = Arc::new(SessionRegistry::new(
            matcher.clone(),
            persistence.clone(),
            config.session_limits,
        ));

        Self {
            config,
            matcher,
            registry,
            retained: Arc::new(RetainedStore::new()),
            authenticator,
            persistence,
        }
    }

    pub fn config(&self) -> &PostOfficeConfig {
        &self.config
    }

    pub fn matcher(&self) -> &Arc<TopicMatcher> {
        &self.matcher
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn retained(&self) -> &Arc<RetainedStore> {
        &self.retained
    }

    /// Install state loaded from storage at startup
    pub fn restore(&self, data: LoadedData) {
        let retained: Vec<RetainedMessage> = data
            .retained
            .into_iter()
            .filter_map(|(topic, m)| match RetainedMessage::try_from(m) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(topic = %topic, "skipping stored retained message: {}", e);
                    None
                }
            })
            .collect();
        let retained_count = retained.len();
        self.retained.restore(retained);
        self.registry
            .restore(data.sessions.into_iter().map(|(_, s)| s));
        for client_id in &data.corrupted_sessions {
            self.registry.mark_corrupted(client_id);
        }

        info!(
            "Restored {} retained messages, {} corrupted sessions",
            retained_count,
            data.corrupted_sessions.len()
        );
    }

    /// Persist every durable session, called once at shutdown
    pub fn shutdown(&self) {
        self.registry.persist_all();
    }

    /// Handle one inbound event for `conn`
    pub async fn handle(&self, conn: &mut ClientConnection, event: InboundEvent) -> Flow {
        let packet = match event {
            InboundEvent::ConnectionLost => {
                self.handle_connection_lost(conn);
                return Flow::Close;
            }
            InboundEvent::Packet(packet) => packet,
        };

        match self.handle_packet(conn, packet).await {
            Ok(flow) => flow,
            Err(e) => {
                debug!(connection_id = conn.id, "closing connection: {}", e);
                Flow::Close
            }
        }
    }

    async fn handle_packet(
        &self,
        conn: &mut ClientConnection,
        packet: Packet,
    ) -> Result<Flow, ProtocolError> {
        let (client_id, session) = match &conn.state {
            ConnectionState::Connecting => {
                return match packet {
                    Packet::Connect(connect) => self.handle_connect(conn, *connect).await,
                    _ => Err(ProtocolError::ProtocolViolation("first packet must be CONNECT")),
                };
            }
            ConnectionState::Disconnected => return Ok(Flow::Close),
            ConnectionState::Connected { client_id, session } => {
                (client_id.clone(), session.clone())
            }
        };

        // a taken-over connection may still have packets in flight
        if !session.read().is_bound_to(conn.id) {
            debug!(client_id = %client_id, connection_id = conn.id, "packet on stale connection");
            conn.state = ConnectionState::Disconnected;
            return Ok(Flow::Close);
        }

        match packet {
            Packet::Connect(_) => Err(ProtocolError::ProtocolViolation("duplicate CONNECT")),
            Packet::Publish(publish) => self.handle_publish(conn, &session, publish),
            Packet::PubAck(puback) => {
                self.handle_puback(&client_id, &session, puback);
                Ok(Flow::Continue)
            }
            Packet::PubRec(pubrec) => {
                self.handle_pubrec(&client_id, &session, pubrec);
                Ok(Flow::Continue)
            }
            Packet::PubRel(pubrel) => {
                self.handle_pubrel(conn, &session, pubrel);
                Ok(Flow::Continue)
            }
            Packet::PubComp(pubcomp) => {
                self.handle_pubcomp(&client_id, &session, pubcomp);
                Ok(Flow::Continue)
            }
            Packet::Subscribe(subscribe) => {
                self.handle_subscribe(conn, &client_id, &session, subscribe)
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(conn, &client_id, &session, unsubscribe);
                Ok(Flow::Continue)
            }
            Packet::PingReq => {
                conn.reply(Packet::PingResp);
                Ok(Flow::Continue)
            }
            Packet::Disconnect => {
                self.handle_disconnect(conn);
                Ok(Flow::Close)
            }
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                warn!(
                    "Unexpected packet type from {}: {:?}",
                    client_id,
                    packet.packet_type()
                );
                Ok(Flow::Continue)
            }
        }
    }
}
