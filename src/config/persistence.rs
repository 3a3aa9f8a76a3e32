//! Persistence configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Persistence configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Store durable sessions and retained messages on disk
    pub enabled: bool,

    /// Data directory path
    pub path: PathBuf,

    /// Flush interval (e.g., "100ms", "1s")
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Maximum batch size before forced flush
    pub max_batch_size: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("./data"),
            flush_interval: Duration::from_millis(100),
            max_batch_size: 100,
        }
    }
}
