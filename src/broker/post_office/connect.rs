//! CONNECT packet handling

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, error, trace, warn};

use super::{ClientConnection, ConnectionState, Flow, PostOffice};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, ProtocolError, PROTOCOL_LEVEL_V31,
    PROTOCOL_LEVEL_V311, PROTOCOL_NAME_V31, PROTOCOL_NAME_V311,
};
use crate::session::{BindError, BindRequest, BoundConnection};
use crate::topic::validate_topic_name;

impl PostOffice {
    /// Handle CONNECT: validate, authenticate, then bind to a session.
    ///
    /// On success the registry sends CONNACK and any redelivery; on refusal a
    /// negative CONNACK is sent here and the connection closes.
    pub(crate) async fn handle_connect(
        &self,
        conn: &mut ClientConnection,
        connect: Connect,
    ) -> Result<Flow, ProtocolError> {
        trace!(
            connection_id = conn.id,
            "CONNECT client_id={:?} clean_session={} username={:?}",
            connect.client_id,
            connect.clean_session,
            connect.username
        );

        let supported = (connect.protocol_name == PROTOCOL_NAME_V311
            && connect.protocol_level == PROTOCOL_LEVEL_V311)
            || (connect.protocol_name == PROTOCOL_NAME_V31
                && connect.protocol_level == PROTOCOL_LEVEL_V31);
        if !supported {
            warn!(
                connection_id = conn.id,
                "Unsupported protocol {} level {}", connect.protocol_name, connect.protocol_level
            );
            return Ok(refuse(conn, ConnectReturnCode::UnacceptableProtocolVersion));
        }

        let client_id: Arc<str> = if connect.client_id.is_empty() {
            if !self.config.allow_zero_byte_client_id || !connect.clean_session {
                debug!(connection_id = conn.id, "empty client id rejected");
                return Ok(refuse(conn, ConnectReturnCode::IdentifierRejected));
            }
            let generated = generate_client_id(conn.id);
            debug!(connection_id = conn.id, "assigned client id {}", generated);
            Arc::from(generated)
        } else {
            Arc::from(connect.client_id)
        };

        if self.config.max_client_id_len > 0 && client_id.len() > self.config.max_client_id_len {
            debug!(client_id = %client_id, "client id too long");
            return Ok(refuse(conn, ConnectReturnCode::IdentifierRejected));
        }

        if connect.username.is_none() && connect.password.is_some() {
            debug!(client_id = %client_id, "password without username");
            return Ok(refuse(conn, ConnectReturnCode::NotAuthorized));
        }

        let authorized = self
            .authenticator
            .check_valid(
                &client_id,
                connect.username.as_deref(),
                connect.password.as_deref(),
            )
            .await;
        if !authorized {
            error!(client_id = %client_id, username = ?connect.username, "authentication failed");
            return Ok(refuse(conn, ConnectReturnCode::BadUsernameOrPassword));
        }

        if let Some(will) = &connect.will {
            validate_topic_name(&will.topic).map_err(ProtocolError::InvalidTopic)?;
        }

        let request = BindRequest {
            client_id: client_id.clone(),
            clean_session: connect.clean_session,
            will: connect.will,
            connection: BoundConnection {
                id: conn.id,
                writer: conn.writer.clone(),
            },
        };

        match self.registry.bind(request) {
            Ok((session, session_present)) => {
                debug!(
                    client_id = %client_id,
                    connection_id = conn.id,
                    session_present,
                    "client connected"
                );
                conn.state = ConnectionState::Connected { client_id, session };
                Ok(Flow::Continue)
            }
            Err(e @ BindError::SessionCorrupted(_)) => {
                error!(client_id = %client_id, "{}", e);
                Ok(refuse(conn, ConnectReturnCode::ServerUnavailable))
            }
        }
    }
}

/// Send a negative CONNACK and close
fn refuse(conn: &mut ClientConnection, code: ConnectReturnCode) -> Flow {
    conn.reply(Packet::ConnAck(ConnAck::new(code, false)));
    conn.state = ConnectionState::Disconnected;
    Flow::Close
}

/// Server-assigned id for clients connecting with an empty one
fn generate_client_id(connection_id: u64) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("tidemq-{:x}-{:x}", nanos, connection_id)
}
