//! tidemq - MQTT v3.1.1 broker built around a session and delivery engine
//!
//! The engine matches topics against subscriptions, runs the per-session QoS
//! 1/2 handshakes with redelivery across reconnects, and dispatches every
//! inbound event (session takeover, last will, retained messages) through
//! one post office.

pub mod auth;
pub mod broker;
pub mod codec;
pub mod config;
pub mod persistence;
pub mod protocol;
pub mod retained;
pub mod session;
pub mod topic;

pub use auth::{AuthProvider, Authenticator};
pub use broker::{Broker, BrokerConfig, PostOffice, PostOfficeConfig};
pub use config::Config;
pub use persistence::{FjallBackend, PersistenceManager, StorageBackend};
pub use protocol::QoS;
pub use retained::RetainedStore;
pub use session::{Session, SessionRegistry};
pub use topic::TopicMatcher;
