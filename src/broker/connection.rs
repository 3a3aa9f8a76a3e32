//! Per-connection transport loop
//!
//! Reads bytes from the socket, frames them into packets and hands them to
//! the post office one at a time. Outbound data never goes through this loop
//! directly: it is encoded into the connection's `SharedWriter` and flushed
//! here when the writer signals new data.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, trace};

use super::post_office::{ClientConnection, Flow, InboundEvent, PostOffice};
use super::writer::{PacketWriter, SharedWriter};
use crate::codec::Decoder;
use crate::protocol::{DecodeError, Packet};

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Decode(DecodeError),
    /// No CONNECT within the connect timeout, or keep alive expired
    Timeout,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Decode(e) => write!(f, "Decode error: {}", e),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

/// Connection handler - generic over the stream type
pub struct Connection<S> {
    stream: S,
    addr: SocketAddr,
    decoder: Decoder,
    read_buf: BytesMut,
    writer: Arc<SharedWriter>,
    client: ClientConnection,
    post_office: Arc<PostOffice>,
    connect_timeout: Duration,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        id: u64,
        stream: S,
        addr: SocketAddr,
        post_office: Arc<PostOffice>,
        max_packet_size: usize,
        max_write_buffer: usize,
        connect_timeout: Duration,
    ) -> Self {
        let writer = Arc::new(SharedWriter::new(max_write_buffer));
        Self {
            stream,
            addr,
            decoder: Decoder::new().with_max_packet_size(max_packet_size),
            read_buf: BytesMut::with_capacity(4096),
            client: ClientConnection::new(id, writer.clone()),
            writer,
            post_office,
            connect_timeout,
        }
    }

    /// Run the connection until it closes.
    ///
    /// The post office always sees `ConnectionLost` at the end, however the
    /// loop ended.
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        let result = self.serve().await;

        self.post_office
            .handle(&mut self.client, InboundEvent::ConnectionLost)
            .await;
        self.writer.close();
        let _ = self.stream.shutdown().await;

        result
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        // Until CONNECT arrives the deadline is the connect timeout; afterwards
        // it is 1.5x the client's keep alive (none if keep alive is 0)
        let mut keep_alive: Option<Duration> = None;
        let mut deadline = Some(Instant::now() + self.connect_timeout);

        loop {
            tokio::select! {
                result = self.stream.read_buf(&mut self.read_buf) => {
                    if result? == 0 {
                        debug!("Connection closed from {}", self.addr);
                        return Ok(());
                    }

                    while let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
                        self.read_buf.advance(consumed);

                        if let Packet::Connect(connect) = &packet {
                            keep_alive = (connect.keep_alive > 0)
                                .then(|| Duration::from_millis(u64::from(connect.keep_alive) * 1500));
                        }
                        deadline = keep_alive.map(|k| Instant::now() + k);

                        let flow = self
                            .post_office
                            .handle(&mut self.client, InboundEvent::Packet(packet))
                            .await;
                        if flow == Flow::Close {
                            self.flush().await?;
                            return Ok(());
                        }
                    }
                }

                _ = self.writer.notified() => {
                    self.flush().await?;
                    if !self.writer.is_alive() {
                        debug!("Writer closed, disconnecting {}", self.addr);
                        return Ok(());
                    }
                }

                _ = async move {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    debug!("Timeout for {} - disconnecting", self.addr);
                    return Err(ConnectionError::Timeout);
                }
            }
        }
    }

    /// Write everything buffered in the shared writer to the socket
    async fn flush(&mut self) -> Result<(), ConnectionError> {
        let data = self.writer.take_buffer();
        if !data.is_empty() {
            trace!("Flushing {} bytes to {}", data.len(), self.addr);
            self.stream.write_all(&data).await?;
            self.stream.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;
    use crate::broker::post_office::PostOfficeConfig;
    use crate::codec::Encoder;
    use crate::protocol::{ConnAck, Connect, ConnectReturnCode};
    use tokio::io::duplex;

    fn post_office() -> Arc<PostOffice> {
        Arc::new(PostOffice::new(
            PostOfficeConfig::default(),
            Arc::new(AllowAll),
            None,
        ))
    }

    fn encode(packet: &Packet) -> BytesMut {
        let mut buf = BytesMut::new();
        Encoder::new().encode(packet, &mut buf).unwrap();
        buf
    }

    async fn read_packet<R: AsyncRead + Unpin>(stream: &mut R, buf: &mut BytesMut) -> Packet {
        let mut decoder = Decoder::new();
        loop {
            if let Some((packet, consumed)) = decoder.decode(&buf[..]).unwrap() {
                buf.advance(consumed);
                return packet;
            }
            let n = stream.read_buf(buf).await.unwrap();
            assert!(n > 0, "stream closed");
        }
    }

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[tokio::test]
    async fn test_connect_and_ping() {
        let (mut client, server) = duplex(4096);
        let po = post_office();
        let mut conn = Connection::new(1, server, addr(), po.clone(), 1024, 1024, Duration::from_secs(5));
        let task = tokio::spawn(async move { conn.run().await });

        let connect = Packet::Connect(Box::new(Connect {
            client_id: "c1".into(),
            ..Default::default()
        }));
        client.write_all(&encode(&connect)).await.unwrap();

        let mut buf = BytesMut::new();
        assert_eq!(
            read_packet(&mut client, &mut buf).await,
            Packet::ConnAck(ConnAck::new(ConnectReturnCode::Accepted, false))
        );

        client.write_all(&encode(&Packet::PingReq)).await.unwrap();
        assert_eq!(read_packet(&mut client, &mut buf).await, Packet::PingResp);

        client.write_all(&encode(&Packet::Disconnect)).await.unwrap();
        assert!(task.await.unwrap().is_ok());
        assert!(po.registry().retrieve("c1").is_none());
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let (_client, server) = duplex(4096);
        let mut conn = Connection::new(1, server, addr(), post_office(), 1024, 1024, Duration::from_millis(50));
        let result = conn.run().await;
        assert!(matches!(result, Err(ConnectionError::Timeout)));
        // the writer is shut once the loop ends
        assert!(!conn.writer.is_writable());
    }

    #[tokio::test]
    async fn test_oversized_packet_is_decode_error() {
        let (mut client, server) = duplex(4096);
        let mut conn = Connection::new(1, server, addr(), post_office(), 16, 1024, Duration::from_secs(5));
        let task = tokio::spawn(async move { conn.run().await });

        let connect = Packet::Connect(Box::new(Connect {
            client_id: "a-client-id-longer-than-sixteen-bytes".into(),
            ..Default::default()
        }));
        client.write_all(&encode(&connect)).await.unwrap();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(ConnectionError::Decode(DecodeError::PacketTooLarge))));
    }
}
