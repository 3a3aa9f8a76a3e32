//! Storage backend trait for persistence.
//!
//! Keys are the topic for retained messages and the client id for sessions,
//! so an upsert is atomic per key and per-client lookup is a key lookup.

use async_trait::async_trait;
use tracing::error;

use super::error::Result;
use super::models::{LoadedData, StoredRetainedMessage, StoredSession};

/// Persistence operation for batch writes
#[derive(Debug, Clone)]
pub enum PersistenceOp {
    /// Set a retained message
    SetRetained {
        topic: String,
        message: StoredRetainedMessage,
    },
    /// Delete a retained message
    DeleteRetained { topic: String },
    /// Set a session
    SetSession {
        client_id: String,
        session: StoredSession,
    },
    /// Delete a session
    DeleteSession { client_id: String },
}

/// Storage backend trait for persistence
#[async_trait]
pub trait StorageBackend: Send + Sync {
    // ========================================================================
    // Retained messages
    // ========================================================================

    /// Get a retained message by topic
    async fn get_retained(&self, topic: &str) -> Result<Option<StoredRetainedMessage>>;

    /// Set a retained message
    async fn set_retained(&self, topic: &str, message: &StoredRetainedMessage) -> Result<()>;

    /// Delete a retained message
    async fn delete_retained(&self, topic: &str) -> Result<()>;

    /// List all retained messages
    async fn list_retained(&self) -> Result<Vec<(String, StoredRetainedMessage)>>;

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Get a session by client ID
    async fn get_session(&self, client_id: &str) -> Result<Option<StoredSession>>;

    /// Set a session
    async fn set_session(&self, client_id: &str, session: &StoredSession) -> Result<()>;

    /// Delete a session
    async fn delete_session(&self, client_id: &str) -> Result<()>;

    /// List all sessions, decoding each record independently so one bad
    /// record does not hide the others
    async fn list_sessions(&self) -> Result<Vec<(String, Result<StoredSession>)>>;

    // ========================================================================
    // Batch operations
    // ========================================================================

    /// Execute a batch of operations atomically
    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()>;

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Flush all pending writes to disk
    async fn flush(&self) -> Result<()>;

    /// Close the backend (flush and release resources)
    async fn close(&self) -> Result<()>;

    /// Load all data at startup.
    ///
    /// Session records that fail to decode are reported in
    /// `corrupted_sessions` instead of failing the load.
    async fn load_all(&self) -> Result<LoadedData> {
        let retained = self.list_retained().await?;

        let mut sessions = Vec::new();
        let mut corrupted_sessions = Vec::new();
        for (client_id, session) in self.list_sessions().await? {
            match session {
                Ok(session) => sessions.push((client_id, session)),
                Err(e) => {
                    error!(client_id = %client_id, "stored session is corrupted: {}", e);
                    corrupted_sessions.push(client_id);
                }
            }
        }

        Ok(LoadedData {
            retained,
            sessions,
            corrupted_sessions,
        })
    }
}
