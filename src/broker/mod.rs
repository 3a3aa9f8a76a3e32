//! MQTT Broker Core
//!
//! TCP accept loop and connection tasks around the post office, which holds
//! the delivery engine itself.

mod connection;
pub mod post_office;
pub mod writer;

pub use connection::{Connection, ConnectionError};
pub use post_office::{
    ClientConnection, ConnectionState, Flow, InboundEvent, PostOffice, PostOfficeConfig,
};
pub use writer::{PacketWriter, SendError, SharedWriter};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::codec::DEFAULT_MAX_PACKET_SIZE;
use crate::protocol::{ProtocolError, Publish, QoS};
use crate::topic::validate_topic_name;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// Maximum packet size
    pub max_packet_size: usize,
    /// Buffered outbound bytes above which a connection stops taking QoS 0
    pub max_write_buffer: usize,
    /// Time allowed between accept and CONNECT
    pub connect_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1883)),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_write_buffer: 1024 * 1024,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// The MQTT Broker
pub struct Broker {
    config: BrokerConfig,
    post_office: Arc<PostOffice>,
    /// Source of connection ids; ids are never reused
    next_connection_id: AtomicU64,
    connections: Arc<AtomicUsize>,
    shutdown: broadcast::Sender<()>,
}

impl Broker {
    pub fn new(config: BrokerConfig, post_office: Arc<PostOffice>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            post_office,
            next_connection_id: AtomicU64::new(1),
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown,
        }
    }

    /// Bind the configured address and run until shutdown
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("MQTT/TCP listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections from `listener` until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        let mut shutdown_rx = self.shutdown.subscribe();

        debug!("Starting TCP accept loop");
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        debug!("New TCP connection from {}", addr);
                        self.handle_connection(stream, addr);
                    }
                    Err(e) => {
                        error!("Failed to accept TCP connection: {}", e);
                    }
                },
                _ = shutdown_rx.recv() => {
                    debug!("Accept loop stopped");
                    return Ok(());
                }
            }
        }
    }

    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let mut conn = Connection::new(
            id,
            stream,
            addr,
            self.post_office.clone(),
            self.config.max_packet_size,
            self.config.max_write_buffer,
            self.config.connect_timeout,
        );
        let connections = self.connections.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            connections.fetch_add(1, Ordering::Relaxed);

            let conn_fut = conn.run();
            tokio::pin!(conn_fut);

            tokio::select! {
                result = &mut conn_fut => {
                    if let Err(e) = result {
                        debug!("Connection error from {}: {}", addr, e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("Connection {} shutting down", addr);
                }
            }

            connections.fetch_sub(1, Ordering::Relaxed);
        });
    }

    /// Stop accepting and end every connection task
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn post_office(&self) -> &Arc<PostOffice> {
        &self.post_office
    }

    /// Number of open network connections
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Publish a message from the server itself
    pub fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ProtocolError> {
        validate_topic_name(topic).map_err(ProtocolError::InvalidTopic)?;
        self.post_office.dispatch(Publish {
            dup: false,
            qos: qos.min(self.post_office.config().max_qos),
            retain,
            topic: Arc::from(topic),
            packet_id: None,
            payload,
        });
        Ok(())
    }
}
