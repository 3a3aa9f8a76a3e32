//! Outbound packet path.
//!
//! `PacketWriter` is the seam between the delivery engine and the transport.
//! `SharedWriter` implements it over a per-connection buffer: senders encode
//! straight into the buffer and the connection task flushes it to the socket.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::codec::Encoder;
use crate::protocol::{EncodeError, Packet};

/// Error when sending to a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Connection is closed
    Closed,
    /// Packet could not be encoded
    Encode(EncodeError),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::Encode(e) => write!(f, "encode error: {}", e),
        }
    }
}

impl std::error::Error for SendError {}

impl From<EncodeError> for SendError {
    fn from(e: EncodeError) -> Self {
        Self::Encode(e)
    }
}

/// Sink for outbound packets of one connection.
pub trait PacketWriter: Send + Sync {
    /// Queue a packet for transmission. Never blocks on I/O.
    fn send(&self, packet: Packet) -> Result<(), SendError>;

    /// Whether the connection currently accepts more data without backlog.
    fn is_writable(&self) -> bool;

    /// Close the connection. Further sends fail with `SendError::Closed`.
    fn close(&self);
}

/// Shared write buffer filled by the delivery engine and drained by the
/// connection task.
pub struct SharedWriter {
    /// Encoded bytes waiting to be written
    buffer: Mutex<BytesMut>,
    /// Wakes the connection loop when the buffer gains data or the writer closes
    notify: Notify,
    encoder: Encoder,
    alive: AtomicBool,
    /// Buffered bytes above which the writer reports itself not writable
    max_write_buffer: usize,
}

impl SharedWriter {
    pub fn new(max_write_buffer: usize) -> Self {
        Self {
            buffer: Mutex::new(BytesMut::with_capacity(2048)),
            notify: Notify::new(),
            encoder: Encoder::new(),
            alive: AtomicBool::new(true),
            max_write_buffer,
        }
    }

    /// Check if the connection is still alive
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Get the notify handle for the connection loop
    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    /// Take all pending data from the buffer
    pub fn take_buffer(&self) -> BytesMut {
        self.buffer.lock().split()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.lock().len()
    }
}

impl PacketWriter for SharedWriter {
    fn send(&self, packet: Packet) -> Result<(), SendError> {
        if !self.is_alive() {
            return Err(SendError::Closed);
        }

        let was_empty = {
            let mut buffer = self.buffer.lock();
            let start_len = buffer.len();
            if let Err(e) = self.encoder.encode(&packet, &mut buffer) {
                buffer.truncate(start_len);
                return Err(e.into());
            }
            start_len == 0
        };

        // Only notify on the empty -> non-empty edge; bursts coalesce into one flush
        if was_empty {
            self.notify.notify_one();
        }
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.is_alive() && self.buffer_len() < self.max_write_buffer
    }

    fn close(&self) {
        self.alive.store(false, Ordering::Release);
        self.notify.notify_one();
    }
}

impl fmt::Debug for SharedWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedWriter")
            .field("buffer_len", &self.buffer_len())
            .field("alive", &self.is_alive())
            .finish()
    }
}
