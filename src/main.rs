//! tidemq - MQTT v3.1.1 broker
//!
//! Usage:
//!   tidemq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -b, --bind <ADDR>      Bind address (default: 0.0.0.0:1883)
//!   --max-qos <N>          Maximum QoS (0, 1 or 2)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use tidemq::auth::AuthProvider;
use tidemq::broker::{Broker, PostOffice};
use tidemq::config::Config;
use tidemq::persistence::{FjallBackend, PersistenceManager};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    }
}

/// tidemq - MQTT broker
#[derive(Parser, Debug)]
#[command(name = "tidemq")]
#[command(version)]
#[command(about = "MQTT v3.1.1 broker with durable sessions")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Maximum QoS level (0, 1, or 2)
    #[arg(long)]
    max_qos: Option<u8>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise defaults plus env overrides
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // CLI args override file config
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(max_qos) = args.max_qos {
        config.mqtt.max_qos = max_qos;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let persistence = if config.persistence.enabled {
        let backend = Arc::new(FjallBackend::open(&config.persistence.path)?);
        info!("  Persistence: enabled ({:?})", config.persistence.path);
        Some(Arc::new(PersistenceManager::new(
            backend,
            config.persistence.flush_interval,
            config.persistence.max_batch_size,
        )))
    } else {
        info!("  Persistence: disabled");
        None
    };

    if config.auth.enabled {
        info!(
            "  Authentication: enabled ({} users configured)",
            config.auth.users.len()
        );
    } else {
        info!("  Authentication: disabled");
    }
    let authenticator = Arc::new(AuthProvider::new(&config.auth));

    let post_office = Arc::new(PostOffice::new(
        config.post_office_config(),
        authenticator,
        persistence.clone(),
    ));

    if let Some(persistence) = &persistence {
        let data = persistence.load_all().await?;
        post_office.restore(data);
    }

    let broker_config = config.broker_config();
    info!("Starting tidemq MQTT Broker");
    info!("  Bind address: {}", broker_config.bind_addr);
    info!("  Max packet size: {} bytes", broker_config.max_packet_size);
    info!("  Max QoS: {:?}", post_office.config().max_qos);

    let broker = Broker::new(broker_config, post_office.clone());

    tokio::select! {
        result = broker.run() => {
            if let Err(e) = result {
                error!("Broker error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    broker.shutdown();
    post_office.shutdown();
    if let Some(persistence) = persistence {
        if let Err(e) = persistence.shutdown().await {
            error!("Failed to flush persistence: {}", e);
        }
    }

    Ok(())
}
