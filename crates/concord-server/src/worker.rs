//! Per-connection worker.
//!
//! Each accepted connection gets one task that drains its command channel
//! and hands every payload to the driver in arrival order. A proposal in
//! flight therefore finishes before a later disconnect is processed. The
//! worker tears the connection down when the command channel closes, the
//! client says goodbye, the registry forgets the connection, or the server
//! shuts down.

use std::sync::Arc;

use concord_core::Environment;
use concord_proto::{ConnectionId, IdentityId, Payload};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    driver::{Flow, ServerDriver},
    server_error::DriverError,
    storage::Storage,
};

/// Transport-side view of an accepted connection.
pub struct ConnectionHandle {
    connection_id: ConnectionId,
    identity: IdentityId,
    resuming: bool,
    commands: mpsc::Sender<Payload>,
    outbound: mpsc::Receiver<Payload>,
    worker: JoinHandle<()>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        connection_id: ConnectionId,
        identity: IdentityId,
        resuming: bool,
        commands: mpsc::Sender<Payload>,
        outbound: mpsc::Receiver<Payload>,
        worker: JoinHandle<()>,
    ) -> Self {
        Self { connection_id, identity, resuming, commands, outbound, worker }
    }

    /// Connection id assigned at registration.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Identity behind the connection.
    pub fn identity(&self) -> IdentityId {
        self.identity
    }

    /// Whether a continuity snapshot was restored on accept.
    pub fn resuming(&self) -> bool {
        self.resuming
    }

    /// Queue a client payload for the worker.
    ///
    /// # Errors
    ///
    /// - `DriverError::ShuttingDown` if the worker has stopped
    pub async fn send(&self, payload: Payload) -> Result<(), DriverError> {
        self.commands.send(payload).await.map_err(|_| DriverError::ShuttingDown)
    }

    /// Next outbound envelope. `None` once the connection is torn down.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.outbound.recv().await
    }

    /// Next outbound envelope if one is already queued.
    pub fn try_recv(&mut self) -> Option<Payload> {
        self.outbound.try_recv().ok()
    }

    /// Close the command channel and wait for the worker to disconnect.
    pub async fn close(self) {
        drop(self.commands);
        if let Err(e) = self.worker.await {
            tracing::error!(connection_id = %self.connection_id, error = %e, "worker panicked");
        }
    }

    /// Split into the command sender, the outbound receiver and the worker
    /// task, for transports that drive each direction separately.
    pub fn into_parts(self) -> (mpsc::Sender<Payload>, mpsc::Receiver<Payload>, JoinHandle<()>) {
        (self.commands, self.outbound, self.worker)
    }
}

/// Spawn the worker for `connection`.
pub(crate) fn spawn<E, S>(
    driver: Arc<ServerDriver<E, S>>,
    connection: ConnectionId,
    mut commands: mpsc::Receiver<Payload>,
) -> JoinHandle<()>
where
    E: Environment,
    S: Storage,
{
    let shutdown = driver.shutdown_token().child_token();

    tokio::spawn(async move {
        let reason = loop {
            let payload = tokio::select! {
                () = shutdown.cancelled() => break "server shutdown",
                payload = commands.recv() => match payload {
                    Some(payload) => payload,
                    None => break "transport closed",
                },
            };

            match driver.handle_payload(connection, payload).await {
                Flow::Continue => {},
                Flow::Goodbye => break "goodbye",
                Flow::Gone => break "connection no longer registered",
            }
        };

        driver.disconnect(connection, reason);
    })
}
