//! Server configuration.

use std::{path::PathBuf, time::Duration};

use concord_core::{BreakerConfig, ConnectionConfig};
use concord_proto::NodeId;

/// Default coalescing window for non-critical events.
pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(25);

/// Default bound on waiting for a session's critical section.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(250);

/// Default lifetime of a cached state record.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Default continuity grace window.
pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(30);

/// Default number of missed versions above which catch-up sends the full state.
pub const DEFAULT_CATCH_UP_THRESHOLD: usize = 32;

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Node id used as the bus origin tag. Random when `None`.
    pub node_id: Option<NodeId>,
    /// Maximum concurrent connections on this node.
    pub max_connections: usize,
    /// Connection idle timeout and heartbeat interval.
    pub connection: ConnectionConfig,
    /// Batching window for non-critical events.
    pub batch_window: Duration,
    /// Bounded wait for a session's critical section.
    pub lock_timeout: Duration,
    /// Lifetime of cached state records.
    pub cache_ttl: Duration,
    /// How long a continuity snapshot survives a disconnect.
    pub grace_window: Duration,
    /// Missed versions above which catch-up sends only the latest state.
    pub catch_up_threshold: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue: usize,
    /// Capacity of each connection's command queue.
    pub command_queue: usize,
    /// Pause before the single retry of a busy proposal.
    pub busy_backoff: Duration,
    /// Circuit breaker settings shared by every guarded dependency.
    pub breaker: BreakerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            max_connections: 10_000,
            connection: ConnectionConfig::default(),
            batch_window: DEFAULT_BATCH_WINDOW,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            cache_ttl: DEFAULT_CACHE_TTL,
            grace_window: DEFAULT_GRACE_WINDOW,
            catch_up_threshold: DEFAULT_CATCH_UP_THRESHOLD,
            outbound_queue: 256,
            command_queue: 64,
            busy_backoff: Duration::from_millis(20),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:4433")
    pub bind_address: String,
    /// Path to TLS certificate (PEM format)
    pub cert_path: Option<String>,
    /// Path to TLS private key (PEM format)
    pub key_path: Option<String>,
    /// redb database file. In-memory storage when `None`.
    pub storage_path: Option<PathBuf>,
    /// Redis URL for the cross-node bus. Single node when `None`.
    pub redis_url: Option<String>,
    /// Credential table entries, `secret=identity:role`.
    pub tokens: Vec<String>,
    /// Driver configuration (timeouts, limits)
    pub driver: ServerConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4433".to_string(),
            cert_path: None,
            key_path: None,
            storage_path: None,
            redis_url: None,
            tokens: Vec::new(),
            driver: ServerConfig::default(),
        }
    }
}
