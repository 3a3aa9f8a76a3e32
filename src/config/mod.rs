//! Configuration Module
//!
//! Provides TOML-based configuration for tidemq with support for:
//! - Server settings (bind address, connect timeout)
//! - Connection and queue limits
//! - Session parameters (client id policy, inbound replay window)
//! - MQTT feature limits
//! - Authentication
//! - Persistence
//! - Environment variable overrides (TIDEMQ__* prefix)

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::{BrokerConfig, PostOfficeConfig};
use crate::protocol::QoS;
use crate::session::SessionLimits;

pub use persistence::PersistenceConfig;

mod persistence;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let Ok(re) = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") else {
        return content.to_string();
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Server configuration
    pub server: ServerConfig,
    /// Connection limits
    pub limits: LimitsConfig,
    /// Session configuration
    pub session: SessionConfig,
    /// MQTT feature configuration
    pub mqtt: MqttConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// Persistence configuration
    pub persistence: PersistenceConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    pub bind: SocketAddr,
    /// Time a new connection has to send CONNECT (e.g. "10s")
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 1883))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Connection limits configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum inbound packet size in bytes
    pub max_packet_size: usize,
    /// Maximum queued messages per offline client (0 = never queue)
    pub max_queued_messages: usize,
    /// Buffered outbound bytes above which a connection is not writable
    /// and QoS 0 deliveries to it are dropped
    pub max_write_buffer: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_packet_size: 1024 * 1024,
            max_queued_messages: 1000,
            max_write_buffer: 1024 * 1024,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum client identifier length (0 = unlimited)
    pub max_client_id_len: usize,
    /// Generate an identifier for clean-session clients that send an empty one
    pub allow_zero_byte_client_id: bool,
    /// How long a completed inbound QoS 1 packet id suppresses DUP retransmissions
    #[serde(with = "humantime_serde")]
    pub replay_window: Duration,
    /// Maximum remembered inbound QoS 1 packet ids per session
    pub replay_window_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_client_id_len: 0,
            allow_zero_byte_client_id: true,
            replay_window: Duration::from_secs(30),
            replay_window_size: 128,
        }
    }
}

/// MQTT feature configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Maximum QoS level (0, 1, or 2)
    pub max_qos: u8,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self { max_qos: 2 }
    }
}

fn default_true() -> bool {
    true
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether authentication is enabled
    pub enabled: bool,
    /// Allow connections without a username when auth is enabled
    #[serde(default = "default_true")]
    pub allow_anonymous: bool,
    /// Static user list
    pub users: Vec<UserConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_anonymous: true,
            users: Vec::new(),
        }
    }
}

/// User configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    /// Username
    pub username: String,
    /// Password (plaintext)
    pub password: String,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `TIDEMQ__` prefix with double underscores for nesting:
    ///    - `TIDEMQ__SERVER__BIND=0.0.0.0:1884` overrides `server.bind`
    ///    - `TIDEMQ__LIMITS__MAX_QUEUED_MESSAGES=50` overrides `limits.max_queued_messages`
    ///    - `TIDEMQ__AUTH__ENABLED=true` overrides `auth.enabled`
    ///
    /// A missing file is not an error; defaults and env vars still apply.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:1883")?
            .set_default("server.connect_timeout", "10s")?
            .set_default("limits.max_packet_size", 1024 * 1024)?
            .set_default("limits.max_queued_messages", 1000)?
            .set_default("limits.max_write_buffer", 1024 * 1024)?
            .set_default("session.max_client_id_len", 0)?
            .set_default("session.allow_zero_byte_client_id", true)?
            .set_default("session.replay_window", "30s")?
            .set_default("session.replay_window_size", 128)?
            .set_default("mqtt.max_qos", 2)?
            .set_default("auth.enabled", false)?
            .set_default("auth.allow_anonymous", true)?
            .set_default("persistence.enabled", false)?
            .set_default("persistence.path", "./data")?
            .set_default("persistence.flush_interval", "100ms")?
            .set_default("persistence.max_batch_size", 100)?;

        let path = path.as_ref();
        if !path.as_os_str().is_empty() {
            match std::fs::read_to_string(path) {
                Ok(content) => {
                    let substituted = substitute_env_vars(&content);
                    builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ConfigError::Io(e)),
            }
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("TIDEMQ")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.max_qos > 2 {
            return Err(ConfigError::Validation(
                "max_qos must be 0, 1, or 2".to_string(),
            ));
        }

        if self.auth.enabled {
            for user in &self.auth.users {
                if user.password.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "User '{}' has empty password",
                        user.username
                    )));
                }
            }
        }

        if self.persistence.enabled && self.persistence.path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "persistence.path is required when persistence is enabled".to_string(),
            ));
        }

        if !self.session.replay_window.is_zero() && self.session.replay_window_size == 0 {
            return Err(ConfigError::Validation(
                "session.replay_window_size must be positive when replay_window is set"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Per-session limits derived from configuration
    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            max_queued_messages: self.limits.max_queued_messages,
            replay_window: self.session.replay_window,
            replay_window_size: self.session.replay_window_size,
        }
    }

    /// Highest QoS granted to subscribers and accepted from publishers
    pub fn max_qos(&self) -> QoS {
        QoS::from_u8(self.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce)
    }

    pub fn post_office_config(&self) -> PostOfficeConfig {
        PostOfficeConfig {
            max_qos: self.max_qos(),
            allow_zero_byte_client_id: self.session.allow_zero_byte_client_id,
            max_client_id_len: self.session.max_client_id_len,
            session_limits: self.session_limits(),
        }
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            bind_addr: self.server.bind,
            max_packet_size: self.limits.max_packet_size,
            max_write_buffer: self.limits.max_write_buffer,
            connect_timeout: self.server.connect_timeout,
        }
    }
}
