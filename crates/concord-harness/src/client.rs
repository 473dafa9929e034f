//! Scripted client for driving a node without a transport.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use concord_core::Environment;
use concord_proto::{
    ConnectionId, IdentityId, Payload, RoomId, RoomKind, SessionId,
    payloads::{
        room::{CreateRoom, Event, JoinRoom, LeaveRoom, Publish},
        session::Goodbye,
        state::{FetchState, Propose},
    },
};
use concord_server::{ConnectionHandle, DriverError, ServerDriver, Storage};

/// How long `expect` waits before giving up, in simulated time.
pub const DEFAULT_EXPECT_TIMEOUT: Duration = Duration::from_secs(2);

/// A connection accepted by a [`ServerDriver`], seen from the client side.
///
/// Every envelope the client receives is recorded, including the ones
/// `expect` skipped over.
pub struct TestClient {
    handle: ConnectionHandle,
    received: Vec<Payload>,
    next_request: u32,
}

impl TestClient {
    /// Authenticate `credential` against `driver`.
    ///
    /// # Errors
    ///
    /// Whatever [`ServerDriver::accept`] refuses the connection with.
    pub async fn connect<E: Environment, S: Storage>(
        driver: &Arc<ServerDriver<E, S>>,
        credential: &str,
    ) -> Result<Self, DriverError> {
        let handle = driver.accept(credential).await?;
        Ok(Self { handle, received: Vec::new(), next_request: 1 })
    }

    /// Connection id the node assigned.
    pub fn id(&self) -> ConnectionId {
        self.handle.connection_id()
    }

    /// Authenticated identity.
    pub fn identity(&self) -> IdentityId {
        self.handle.identity()
    }

    /// Whether the node restored a continuity snapshot on connect.
    pub fn resuming(&self) -> bool {
        self.handle.resuming()
    }

    /// Every envelope received so far, in arrival order.
    pub fn received(&self) -> &[Payload] {
        &self.received
    }

    /// Send a raw payload.
    ///
    /// # Errors
    ///
    /// - `DriverError::ShuttingDown` if the connection's worker has stopped
    pub async fn send(&self, payload: Payload) -> Result<(), DriverError> {
        self.handle.send(payload).await
    }

    /// Join `room`.
    pub async fn join(&self, room: &RoomId, kind: RoomKind) -> Result<(), DriverError> {
        self.send(Payload::JoinRoom(JoinRoom { room: room.clone(), kind })).await
    }

    /// Create `room` with default persistence and no metadata.
    pub async fn create(&self, room: &RoomId, kind: RoomKind) -> Result<(), DriverError> {
        self.send(Payload::CreateRoom(CreateRoom {
            room: room.clone(),
            kind,
            persistence: None,
            metadata: Bytes::new(),
        }))
        .await
    }

    /// Leave `room`.
    pub async fn leave(&self, room: &RoomId) -> Result<(), DriverError> {
        self.send(Payload::LeaveRoom(LeaveRoom { room: room.clone() })).await
    }

    /// Propose `payload` as the successor of `base_version`.
    ///
    /// Returns the request id the result will carry.
    pub async fn propose(
        &mut self,
        session: &SessionId,
        room: &RoomId,
        base_version: u64,
        payload: Bytes,
    ) -> Result<u32, DriverError> {
        let request_id = self.next_request;
        self.next_request += 1;
        self.send(Payload::Propose(Propose {
            request_id,
            session: session.clone(),
            room: room.clone(),
            base_version,
            payload,
        }))
        .await?;
        Ok(request_id)
    }

    /// Ask for the current state of `session`.
    pub async fn fetch(&self, session: &SessionId) -> Result<(), DriverError> {
        self.send(Payload::FetchState(FetchState { session: session.clone() })).await
    }

    /// Publish `event` to `room`.
    pub async fn publish(
        &self,
        room: &RoomId,
        event: Event,
        exclude_self: bool,
    ) -> Result<(), DriverError> {
        self.send(Payload::Publish(Publish { room: room.clone(), event, exclude_self })).await
    }

    /// Wait for the next envelope matching `predicate`, skipping others.
    ///
    /// `None` if nothing matched within [`DEFAULT_EXPECT_TIMEOUT`] or the
    /// connection closed.
    pub async fn expect<F>(&mut self, predicate: F) -> Option<Payload>
    where
        F: Fn(&Payload) -> bool,
    {
        self.expect_within(DEFAULT_EXPECT_TIMEOUT, predicate).await
    }

    /// [`Self::expect`] with an explicit timeout.
    pub async fn expect_within<F>(&mut self, timeout: Duration, predicate: F) -> Option<Payload>
    where
        F: Fn(&Payload) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let payload = tokio::time::timeout_at(deadline, self.handle.recv()).await.ok()??;
            self.received.push(payload.clone());
            if predicate(&payload) {
                return Some(payload);
            }
        }
    }

    /// Collect everything that arrives within `window`.
    pub async fn drain_for(&mut self, window: Duration) -> Vec<Payload> {
        let deadline = tokio::time::Instant::now() + window;
        let mut drained = Vec::new();
        while let Ok(Some(payload)) = tokio::time::timeout_at(deadline, self.handle.recv()).await {
            self.received.push(payload.clone());
            drained.push(payload);
        }
        drained
    }

    /// Say goodbye and wait for the node to tear the connection down.
    pub async fn goodbye(self) {
        let _ = self.send(Payload::Goodbye(Goodbye { reason: "done".to_owned() })).await;
        self.handle.close().await;
    }

    /// Drop the connection without a goodbye, as a lost transport would.
    pub async fn drop_connection(self) {
        self.handle.close().await;
    }
}
