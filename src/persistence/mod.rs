//! Persistence for tidemq.
//!
//! Durable storage for retained messages and durable sessions (with their
//! in-flight QoS 1/2 state and offline queue), restored at startup.
//!
//! Writes are fire-and-forget from the delivery path: operations go through a
//! bounded channel to a background task that batches and commits them.

mod backend;
mod error;
mod fjall;
mod models;

pub use backend::{PersistenceOp, StorageBackend};
pub use error::{PersistenceError, Result};
pub use fjall::FjallBackend;
pub use models::{
    LoadedData, StoredInflightMessage, StoredPublish, StoredRetainedMessage, StoredSession,
    StoredSubscription, StoredWillMessage,
};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::retained::RetainedMessage;
use crate::session::Session;

/// Persistence manager that handles background writes
pub struct PersistenceManager {
    backend: Arc<dyn StorageBackend>,
    tx: mpsc::Sender<PersistenceOp>,
    shutdown_tx: mpsc::Sender<()>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceManager {
    /// Create a new persistence manager with the given backend
    ///
    /// This spawns a background task that batches and commits writes, so it
    /// must be called inside a tokio runtime.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(10_000);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let writer = tokio::spawn(Self::writer_loop(
            backend.clone(),
            rx,
            shutdown_rx,
            flush_interval,
            max_batch_size.max(1),
        ));

        Self {
            backend,
            tx,
            shutdown_tx,
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Fire-and-forget write operation (non-blocking for hot path)
    ///
    /// If the channel is full, the operation is dropped (backpressure).
    pub fn write(&self, op: PersistenceOp) {
        if let Err(e) = self.tx.try_send(op) {
            warn!("Persistence channel full, dropping operation: {}", e);
        }
    }

    /// Snapshot a durable session
    pub fn save_session(&self, session: &Session) {
        self.write(PersistenceOp::SetSession {
            client_id: session.client_id.to_string(),
            session: StoredSession::from_session(session),
        });
    }

    pub fn delete_session(&self, client_id: &str) {
        self.write(PersistenceOp::DeleteSession {
            client_id: client_id.to_string(),
        });
    }

    pub fn save_retained(&self, message: &RetainedMessage) {
        self.write(PersistenceOp::SetRetained {
            topic: message.topic.to_string(),
            message: StoredRetainedMessage::from(message),
        });
    }

    pub fn delete_retained(&self, topic: &str) {
        self.write(PersistenceOp::DeleteRetained {
            topic: topic.to_string(),
        });
    }

    /// Load all data at startup
    pub async fn load_all(&self) -> Result<LoadedData> {
        self.backend.load_all().await
    }

    /// Gracefully shutdown the persistence manager
    ///
    /// Waits for the writer task to commit everything queued so far, then
    /// flushes and closes the backend.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down persistence manager");

        let _ = self.shutdown_tx.send(()).await;
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                error!("Persistence writer task failed: {}", e);
            }
        }

        self.backend.flush().await?;
        self.backend.close().await?;

        info!("Persistence manager shutdown complete");
        Ok(())
    }

    /// Background writer loop that batches and commits writes
    async fn writer_loop(
        backend: Arc<dyn StorageBackend>,
        mut rx: mpsc::Receiver<PersistenceOp>,
        mut shutdown_rx: mpsc::Receiver<()>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) {
        let mut batch = Vec::with_capacity(max_batch_size);
        let mut interval = tokio::time::interval(flush_interval);

        loop {
            tokio::select! {
                op = rx.recv() => {
                    match op {
                        Some(op) => {
                            batch.push(op);

                            if batch.len() >= max_batch_size {
                                let count = batch.len();
                                if let Err(e) = backend.batch_write(std::mem::take(&mut batch)).await {
                                    error!("Failed to write batch: {}", e);
                                } else {
                                    debug!("Flushed {} operations (max batch)", count);
                                }
                            }
                        }
                        None => break,
                    }
                }

                _ = interval.tick() => {
                    if !batch.is_empty() {
                        let count = batch.len();
                        if let Err(e) = backend.batch_write(std::mem::take(&mut batch)).await {
                            error!("Failed to write batch: {}", e);
                        } else {
                            debug!("Flushed {} operations (interval)", count);
                        }
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("Persistence writer received shutdown signal");
                    // drain what was queued before the signal
                    while let Ok(op) = rx.try_recv() {
                        batch.push(op);
                    }
                    break;
                }
            }
        }

        if !batch.is_empty() {
            let count = batch.len();
            if let Err(e) = backend.batch_write(std::mem::take(&mut batch)).await {
                error!("Failed to write final batch: {}", e);
            } else {
                info!("Flushed {} operations on exit", count);
            }
        }

        info!("Persistence writer loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;
    use crate::session::SessionLimits;
    use bytes::Bytes;

    fn stored_retained(topic: &str, payload: &[u8], qos: u8) -> StoredRetainedMessage {
        StoredRetainedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            timestamp_secs: models::now_unix_secs(),
        }
    }

    #[tokio::test]
    async fn test_fjall_backend_basic_operations() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = FjallBackend::open(temp_dir.path()).unwrap();

        let message = stored_retained("test/topic", &[1, 2, 3], 1);
        backend.set_retained("test/topic", &message).await.unwrap();

        let retrieved = backend.get_retained("test/topic").await.unwrap().unwrap();
        assert_eq!(retrieved.topic, "test/topic");
        assert_eq!(retrieved.payload, vec![1, 2, 3]);

        backend.delete_retained("test/topic").await.unwrap();
        assert!(backend.get_retained("test/topic").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fjall_backend_batch_write() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = FjallBackend::open(temp_dir.path()).unwrap();

        let session = Session::new("c1".into(), false, SessionLimits::default());
        let ops = vec![
            PersistenceOp::SetRetained {
                topic: "topic1".to_string(),
                message: stored_retained("topic1", &[1], 0),
            },
            PersistenceOp::SetRetained {
                topic: "topic2".to_string(),
                message: stored_retained("topic2", &[2], 1),
            },
            PersistenceOp::DeleteRetained {
                topic: "topic1".to_string(),
            },
            PersistenceOp::SetSession {
                client_id: "c1".to_string(),
                session: StoredSession::from_session(&session),
            },
        ];

        backend.batch_write(ops).await.unwrap();

        let retained = backend.list_retained().await.unwrap();
        assert_eq!(retained.len(), 1);
        assert_eq!(retained[0].0, "topic2");
        assert!(backend.get_session("c1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_load_all_reports_corrupted_sessions() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = FjallBackend::open(temp_dir.path()).unwrap();

        let session = Session::new("good".into(), false, SessionLimits::default());
        backend
            .set_session("good", &StoredSession::from_session(&session))
            .await
            .unwrap();
        backend.insert_raw_session("bad", &[0xFF, 0xFF, 0xFF]).unwrap();

        let loaded = backend.load_all().await.unwrap();
        assert_eq!(loaded.sessions.len(), 1);
        assert_eq!(loaded.sessions[0].0, "good");
        assert_eq!(loaded.corrupted_sessions, vec!["bad".to_string()]);
    }

    #[tokio::test]
    async fn test_manager_commits_on_shutdown() {
        let temp_dir = tempfile::tempdir().unwrap();
        {
            let backend = Arc::new(FjallBackend::open(temp_dir.path()).unwrap());
            let manager = PersistenceManager::new(backend, Duration::from_secs(3600), 1000);

            manager.save_retained(&RetainedMessage {
                topic: "a/b".into(),
                payload: Bytes::from_static(b"on"),
                qos: QoS::AtLeastOnce,
            });
            let mut session = Session::new("dev".into(), false, SessionLimits::default());
            session.add_subscription("a/#", QoS::AtLeastOnce);
            manager.save_session(&session);

            manager.shutdown().await.unwrap();
        }

        let backend = FjallBackend::open(temp_dir.path()).unwrap();
        let loaded = backend.load_all().await.unwrap();
        assert_eq!(loaded.retained.len(), 1);
        assert_eq!(loaded.retained[0].1.payload, b"on".to_vec());
        assert_eq!(loaded.sessions.len(), 1);
        assert_eq!(loaded.sessions[0].1.subscriptions[0].filter, "a/#");
    }
}
