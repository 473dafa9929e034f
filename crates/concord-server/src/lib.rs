//! Concord production server.
//!
//! Real-time synchronization node using Quinn for QUIC transport, Tokio for
//! the async runtime, and system time with cryptographic RNG.
//!
//! # Architecture
//!
//! [`ServerDriver`] owns the synchronization components and is the only thing
//! transports talk to:
//!
//! - [`ConnectionRegistry`]: live connections and the identities behind them
//! - [`RoomManager`]: room membership, creation and ephemeral cleanup
//! - [`StateStore`] and [`ConflictResolver`]: versioned session state with a
//!   per-session compare-and-swap over durable [`Storage`]
//! - [`BroadcastRouter`]: local fan-out with per-scope batching
//! - [`StateFeed`]: delivers every session's versions to local watchers in
//!   order, recovering gaps from storage
//! - [`Propagator`]: relays broadcasts and room lifecycle over a [`Bus`]
//! - [`ContinuityManager`]: resumes identities that reconnect within a grace
//!   window
//! - [`ResilienceGuard`]: circuit breaker around storage, bus and
//!   authenticator calls
//!
//! [`Server`] binds a [`QuinnTransport`] and runs one worker per connection.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod batch;
pub mod bus;
mod cache;
mod config;
mod continuity;
mod driver;
mod error;
mod guard;
mod propagator;
mod registry;
mod resolver;
mod room_manager;
mod router;
mod server_error;
mod state_feed;
mod state_store;
pub mod storage;
mod system_env;
#[cfg(test)]
mod test_env;
mod transport;
mod worker;

use std::sync::Arc;

pub use auth::{AuthError, Authenticator, TokenAuthenticator, VerifiedIdentity};
pub use batch::{BatchScope, coalesce};
pub use bus::{Bus, BusDelivery, BusError, BusEvent, BusSubscription, LocalBus, RedisBus};
pub use cache::StateCache;
pub use concord_core::StrictRules;
use concord_proto::{ErrorPayload, FrameHeader, Payload};
pub use config::{
    DEFAULT_BATCH_WINDOW, DEFAULT_CACHE_TTL, DEFAULT_CATCH_UP_THRESHOLD, DEFAULT_GRACE_WINDOW,
    DEFAULT_LOCK_TIMEOUT, ServerConfig, ServerRuntimeConfig,
};
pub use continuity::{CatchUpPlan, ContinuityManager, ContinuitySnapshot};
pub use driver::{Flow, ServerDriver, TickReport};
pub use error::ServerError;
pub use guard::{DependencyFailure, GuardError, ResilienceGuard};
pub use propagator::{BusBody, BusMessage, Propagator, PropagatorStats, TOPIC_PREFIX};
pub use registry::{ConnectionRegistry, Registration, Unregistered};
pub use resolver::{Accepted, ConflictResolver};
pub use room_manager::{JoinOutcome, LeaveOutcome, Room, RoomManager, RoomSelector};
pub use router::{BroadcastRouter, RouterStats};
pub use server_error::DriverError;
pub use state_feed::{Classified, StateFeed, VersionView};
pub use state_store::{Persisted, StateStore};
pub use storage::{ChaoticStorage, MemoryStorage, RedbStorage, Storage, StorageError};
pub use system_env::SystemEnv;
pub use transport::{QuinnConnection, QuinnTransport, read_frame, write_payload};
pub use worker::ConnectionHandle;

/// Production Concord server.
///
/// Wraps `ServerDriver` with Quinn QUIC transport and system environment.
pub struct Server<S: Storage> {
    driver: Arc<ServerDriver<SystemEnv, S>>,
    transport: QuinnTransport,
}

impl<S: Storage> Server<S> {
    /// Create the driver over `storage` and bind the transport.
    ///
    /// With a Redis URL configured the node joins the cluster on that bus;
    /// otherwise it runs standalone.
    pub async fn bind(config: ServerRuntimeConfig, storage: S) -> Result<Self, ServerError> {
        let auth = TokenAuthenticator::from_entries(config.tokens.iter().map(String::as_str))
            .map_err(|entry| ServerError::Config(format!("invalid token entry '{entry}'")))?;
        if auth.is_empty() {
            tracing::warn!("no credentials configured - every connection will be rejected");
        }

        let env = SystemEnv::new();
        let driver = match &config.redis_url {
            Some(url) => {
                let bus = RedisBus::connect(url).await?;
                ServerDriver::clustered(
                    env,
                    storage,
                    config.driver,
                    Arc::new(auth),
                    Arc::new(StrictRules),
                    Arc::new(bus),
                )
                .await?
            },
            None => ServerDriver::new(
                env,
                storage,
                config.driver,
                Arc::new(auth),
                Arc::new(StrictRules),
            ),
        };

        let transport = QuinnTransport::bind(&config.bind_address, config.cert_path, config.key_path)?;

        Ok(Self { driver, transport })
    }

    /// The driver behind this server.
    pub fn driver(&self) -> &Arc<ServerDriver<SystemEnv, S>> {
        &self.driver
    }

    /// Run the server, accepting connections until [`Self::shutdown`].
    pub async fn run(&self) -> Result<(), ServerError> {
        tracing::info!(
            addr = %self.transport.local_addr()?,
            node_id = %self.driver.node_id(),
            "server starting"
        );

        let shutdown = self.driver.shutdown_token().child_token();
        tokio::spawn(maintenance(Arc::clone(&self.driver), shutdown.clone()));

        loop {
            let accepted = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.transport.accept() => accepted,
            };

            match accepted {
                Ok(Some(conn)) => {
                    let driver = Arc::clone(&self.driver);
                    tokio::spawn(async move {
                        let remote = conn.remote_addr();
                        if let Err(e) = handle_connection(conn, driver).await {
                            tracing::debug!(%remote, error = %e, "connection ended with error");
                        }
                    });
                },
                Ok(None) => break,
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            }
        }

        tracing::info!("server stopped");
        Ok(())
    }

    /// Stop accepting, cancel background tasks and close every connection.
    pub fn shutdown(&self) {
        self.driver.shutdown();
        self.transport.close();
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ServerError> {
        self.transport.local_addr()
    }
}

async fn maintenance<S: Storage>(
    driver: Arc<ServerDriver<SystemEnv, S>>,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(driver.config().connection.heartbeat_interval);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let report = driver.tick();
                tracing::trace!(?report, "maintenance tick");
            },
        }
    }
}

/// Serve one QUIC connection: handshake, then pump frames both ways.
async fn handle_connection<S: Storage>(
    conn: QuinnConnection,
    driver: Arc<ServerDriver<SystemEnv, S>>,
) -> Result<(), ServerError> {
    let (mut send, mut recv) = conn.accept_bi().await?;

    let Some(frame) = read_frame(&mut recv).await? else {
        return Ok(());
    };
    let hello = match Payload::from_frame(&frame)? {
        Payload::Hello(hello) if hello.version == FrameHeader::VERSION => hello,
        Payload::Hello(hello) => {
            let message = format!("unsupported protocol version {}", hello.version);
            return reject(&conn, &mut send, ErrorPayload::invalid_payload(message)).await;
        },
        _ => {
            return reject(&conn, &mut send, ErrorPayload::invalid_payload("expected Hello")).await;
        },
    };

    let handle = match driver.accept(&hello.credential).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!(remote = %conn.remote_addr(), error = %e, "handshake rejected");
            return reject(&conn, &mut send, e.to_payload()).await;
        },
    };
    drop(send);

    let connection_id = handle.connection_id();
    let (commands, mut outbound, worker) = handle.into_parts();

    let mut out_stream = conn.open_uni().await?;
    let writer_conn = conn.clone();
    let writer = tokio::spawn(async move {
        while let Some(payload) = outbound.recv().await {
            if let Err(e) = write_payload(&mut out_stream, payload).await {
                tracing::debug!(connection_id = %connection_id, error = %e, "outbound write failed");
                break;
            }
        }
        let _ = out_stream.finish();
        writer_conn.close(0u32.into(), b"closed");
    });

    loop {
        let frame = match read_frame(&mut recv).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(connection_id = %connection_id, error = %e, "inbound read ended");
                break;
            },
        };

        match Payload::from_frame(&frame) {
            Ok(payload) => {
                if commands.send(payload).await.is_err() {
                    break;
                }
            },
            Err(e) => {
                tracing::warn!(connection_id = %connection_id, error = %e, "undecodable payload");
                driver
                    .router()
                    .send_direct(connection_id, Payload::Error(ErrorPayload::invalid_payload(e.to_string())));
            },
        }
    }

    drop(commands);
    if let Err(e) = worker.await {
        tracing::error!(connection_id = %connection_id, error = %e, "worker panicked");
    }
    if let Err(e) = writer.await {
        tracing::error!(connection_id = %connection_id, error = %e, "writer panicked");
    }
    Ok(())
}

async fn reject(
    conn: &QuinnConnection,
    send: &mut quinn::SendStream,
    error: ErrorPayload,
) -> Result<(), ServerError> {
    write_payload(send, Payload::Error(error)).await?;
    let _ = send.finish();
    // Give the peer a moment to read the error before the close frame lands
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    conn.close(1u32.into(), b"handshake rejected");
    Ok(())
}
