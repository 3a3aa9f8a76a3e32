//! Persistence error types.

use std::fmt;

/// Errors from the storage layer
#[derive(Debug)]
pub enum PersistenceError {
    Io(std::io::Error),
    /// fjall keyspace or partition failure
    Storage(fjall::Error),
    /// A model could not be bincode-encoded
    Encode(bincode::error::EncodeError),
    /// A stored value could not be decoded
    Decode(bincode::error::DecodeError),
    /// A stored session record is unreadable; the client id is kept so the
    /// registry can refuse durable reconnects for it
    CorruptSession {
        client_id: String,
        reason: String,
    },
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::Storage(e) => write!(f, "storage error: {}", e),
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::Decode(e) => write!(f, "decode error: {}", e),
            Self::CorruptSession { client_id, reason } => {
                write!(f, "corrupted session {}: {}", client_id, reason)
            }
        }
    }
}

impl std::error::Error for PersistenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Storage(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::CorruptSession { .. } => None,
        }
    }
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<fjall::Error> for PersistenceError {
    fn from(err: fjall::Error) -> Self {
        Self::Storage(err)
    }
}

impl From<bincode::error::EncodeError> for PersistenceError {
    fn from(err: bincode::error::EncodeError) -> Self {
        Self::Encode(err)
    }
}

impl From<bincode::error::DecodeError> for PersistenceError {
    fn from(err: bincode::error::DecodeError) -> Self {
        Self::Decode(err)
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
