//! Concord server binary.
//!
//! # Usage
//!
//! ```bash
//! # Single node, in-memory state, self-signed certificate (development)
//! concord-server --bind 0.0.0.0:4433 --token s3cr3t=1:player
//!
//! # Clustered node with durable state and a real certificate
//! concord-server --bind 0.0.0.0:4433 --cert cert.pem --key key.pem \
//!     --db /var/lib/concord/state.redb --redis redis://10.0.0.5/ \
//!     --token s3cr3t=1:player --token ops=99:admin
//! ```

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use concord_server::{
    MemoryStorage, RedbStorage, Server, ServerConfig, ServerError, ServerRuntimeConfig, Storage,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Concord real-time synchronization server
#[derive(Parser, Debug)]
#[command(name = "concord-server")]
#[command(about = "Concord real-time synchronization server")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:4433")]
    bind: String,

    /// Path to TLS certificate (PEM format)
    #[arg(short, long)]
    cert: Option<String>,

    /// Path to TLS private key (PEM format)
    #[arg(short, long)]
    key: Option<String>,

    /// Maximum concurrent connections
    #[arg(long, default_value = "10000")]
    max_connections: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// redb file for durable session state (in-memory if omitted)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Redis URL of the cross-node bus (standalone if omitted)
    #[arg(long)]
    redis: Option<String>,

    /// Batching window for non-critical events, in milliseconds
    #[arg(long, default_value = "25")]
    batch_window_ms: u64,

    /// Continuity grace window, in seconds
    #[arg(long, default_value = "30")]
    grace_secs: u64,

    /// Accepted credential, `secret=identity:role` (repeatable)
    #[arg(long = "token")]
    tokens: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!(bind = %args.bind, "concord server starting");

    if args.cert.is_none() || args.key.is_none() {
        tracing::warn!("no TLS certificate provided - using self-signed certificate");
    }

    let config = ServerRuntimeConfig {
        bind_address: args.bind,
        cert_path: args.cert,
        key_path: args.key,
        storage_path: args.db,
        redis_url: args.redis,
        tokens: args.tokens,
        driver: ServerConfig {
            max_connections: args.max_connections,
            batch_window: Duration::from_millis(args.batch_window_ms),
            grace_window: Duration::from_secs(args.grace_secs),
            ..Default::default()
        },
    };

    match config.storage_path.clone() {
        Some(path) => {
            tracing::info!(path = %path.display(), "using durable storage");
            serve(config, RedbStorage::open(path)?).await?;
        },
        None => serve(config, MemoryStorage::new()).await?,
    }

    Ok(())
}

async fn serve<S: Storage>(config: ServerRuntimeConfig, storage: S) -> Result<(), ServerError> {
    let server = Server::bind(config, storage).await?;
    tracing::info!(addr = %server.local_addr()?, "server listening");

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received");
            server.shutdown();
        },
    }

    Ok(())
}
