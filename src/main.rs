//! HubMQ - MQTT v3.1/v3.1.1 broker
//!
//! Usage:
//!   hubmq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>          Configuration file path
//!   -b, --bind <ADDR>            Bind address (default: 0.0.0.0:1883)
//!   -w, --workers <N>            Number of worker threads (default: CPU count)
//!   --max-connections <N>        Maximum connections (default: 100000)
//!   --max-packet-size <N>        Maximum packet size (default: 1MB)
//!   --keep-alive-grace <F>       Keep alive multiplier (default: 1.5)
//!   --allow-anonymous <BOOL>     Accept clients without a username
//!   --username-as-client-id      Use the username as the client id
//!   -l, --log-level              Log level (error, warn, info, debug, trace)
//!   -h, --help                   Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use hubmq::auth::{AllowAll, Authenticator, StaticAuth};
use hubmq::broker::Broker;
use hubmq::config::Config;
use hubmq::store::MemoryStore;

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

/// HubMQ - MQTT broker
#[derive(Parser, Debug)]
#[command(name = "hubmq")]
#[command(version)]
#[command(about = "MQTT v3.1/v3.1.1 broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Number of worker threads (0 = auto)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Maximum connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Maximum packet size in bytes
    #[arg(long)]
    max_packet_size: Option<usize>,

    /// Keep alive multiplier before a silent client is dropped
    #[arg(long)]
    keep_alive_grace: Option<f64>,

    /// Accept clients that send no username
    #[arg(long)]
    allow_anonymous: Option<bool>,

    /// Use the CONNECT username as the client id
    #[arg(long)]
    username_as_client_id: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise defaults plus env overrides
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let file_config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            std::process::exit(1);
        }
    };

    // CLI overrides config, config overrides default (warn)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&file_config.log.level));

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

    let mut broker_config = file_config.to_broker_config();
    if let Some(bind) = args.bind {
        broker_config.bind_addr = bind;
    }
    if let Some(max) = args.max_connections {
        broker_config.max_connections = max;
    }
    if let Some(max) = args.max_packet_size {
        broker_config.max_packet_size = max;
    }
    if let Some(grace) = args.keep_alive_grace {
        if grace < 1.0 {
            eprintln!("Invalid keep-alive-grace {}: must be at least 1.0", grace);
            std::process::exit(1);
        }
        broker_config.keep_alive_grace = grace;
    }
    if let Some(allow) = args.allow_anonymous {
        broker_config.allow_anonymous = allow;
    }
    if args.username_as_client_id {
        broker_config.username_as_client_id = true;
    }

    let workers = args.workers.unwrap_or(file_config.server.workers);
    let num_workers = if workers == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    } else {
        workers
    };

    info!("Starting HubMQ MQTT Broker");
    info!("  Bind address: {}", broker_config.bind_addr);
    info!("  Workers: {}", num_workers);
    info!("  Max connections: {}", broker_config.max_connections);
    info!("  Max packet size: {} bytes", broker_config.max_packet_size);
    info!("  Max QoS: {:?}", broker_config.max_qos);
    info!(
        "  Outbound queue: {} frames ({:?})",
        broker_config.outbound_queue_capacity, broker_config.overflow_policy
    );
    info!("  Storage: {}", file_config.storage.backend);

    if file_config.auth.enabled {
        info!(
            "  Authentication: enabled ({} users configured)",
            file_config.auth.users.len()
        );
    } else {
        info!("  Authentication: disabled");
    }
    if file_config.acl.enabled {
        info!(
            "  ACL: enabled ({} roles configured)",
            file_config.acl.roles.len()
        );
    } else {
        info!("  ACL: disabled");
    }

    let auth: Arc<dyn Authenticator> =
        if file_config.auth.enabled || file_config.acl.enabled || !file_config.auth.psk.is_empty() {
            Arc::new(StaticAuth::new(&file_config.auth, &file_config.acl)?)
        } else {
            Arc::new(AllowAll)
        };
    let broker = Broker::with_parts(broker_config, auth, Arc::new(MemoryStore::new()));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_workers)
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let signal_broker = broker.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Shutdown signal received");
                    signal_broker.shutdown();
                }
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
        });

        broker.run().await
    })?;

    Ok(())
}
