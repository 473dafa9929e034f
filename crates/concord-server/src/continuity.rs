//! Continuity manager: short-lived context for reconnecting identities.
//!
//! When an identity's last connection goes away, the driver captures the
//! rooms that connection held and the last version it saw of each session.
//! A reconnection within the grace window consumes the snapshot: the driver
//! rejoins the rooms and pushes a catch-up per session. After the window the
//! snapshot is discarded and the identity starts from scratch.

use std::{collections::HashMap, time::Duration};

use concord_core::{Environment, StateRecord, SyncError};
use concord_proto::{IdentityId, RoomId, RoomKind, SessionId};
use dashmap::DashMap;

use crate::{state_store::StateStore, storage::Storage};

/// Context preserved across a disconnect.
#[derive(Debug, Clone)]
pub struct ContinuitySnapshot<I> {
    /// Disconnected identity.
    pub identity: IdentityId,
    /// Rooms held at disconnect, with their kinds.
    pub rooms: Vec<(RoomId, RoomKind)>,
    /// Last version delivered per session.
    pub pointers: HashMap<SessionId, u64>,
    /// When the snapshot was taken.
    pub created_at: I,
}

/// What a reconnecting client needs for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatchUpPlan {
    /// Nothing was missed.
    UpToDate,
    /// Every missed version, ascending.
    Diffs(Vec<StateRecord>),
    /// Too many versions were missed; the latest full state.
    Full(StateRecord),
}

/// Snapshots keyed by identity, each valid for the grace window.
pub struct ContinuityManager<E: Environment> {
    env: E,
    grace: Duration,
    threshold: usize,
    snapshots: DashMap<IdentityId, ContinuitySnapshot<E::Instant>>,
}

impl<E: Environment> ContinuityManager<E> {
    /// Create a manager keeping snapshots for `grace` and switching to a full
    /// state push above `threshold` missed versions.
    pub fn new(env: E, grace: Duration, threshold: usize) -> Self {
        Self { env, grace, threshold, snapshots: DashMap::new() }
    }

    /// Store a snapshot for `identity`, replacing any previous one.
    pub fn capture(
        &self,
        identity: IdentityId,
        rooms: Vec<(RoomId, RoomKind)>,
        pointers: HashMap<SessionId, u64>,
    ) {
        tracing::debug!(
            identity = %identity,
            rooms = rooms.len(),
            sessions = pointers.len(),
            "continuity snapshot captured"
        );
        let snapshot = ContinuitySnapshot { identity, rooms, pointers, created_at: self.env.now() };
        self.snapshots.insert(identity, snapshot);
    }

    /// Consume the snapshot for `identity` if it is still within the grace
    /// window.
    pub fn take(&self, identity: IdentityId) -> Option<ContinuitySnapshot<E::Instant>> {
        let (_, snapshot) = self.snapshots.remove(&identity)?;
        if self.env.now() - snapshot.created_at > self.grace {
            tracing::debug!(identity = %identity, "continuity snapshot expired");
            return None;
        }
        Some(snapshot)
    }

    /// Drop expired snapshots. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = self.env.now();
        let before = self.snapshots.len();
        self.snapshots.retain(|_, snapshot| now - snapshot.created_at <= self.grace);
        before.saturating_sub(self.snapshots.len())
    }

    /// Whether a snapshot is held for `identity`, expired or not.
    pub fn contains(&self, identity: IdentityId) -> bool {
        self.snapshots.contains_key(&identity)
    }

    /// Number of held snapshots.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether no snapshot is held.
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Missed versions of `session` since `last_seen`.
    ///
    /// # Errors
    ///
    /// - `SyncError::DependencyUnavailable` or `SyncError::Storage` if durable
    ///   storage is failing
    pub async fn catch_up<S: Storage>(
        &self,
        store: &StateStore<E, S>,
        session: &SessionId,
        last_seen: u64,
    ) -> Result<CatchUpPlan, SyncError> {
        let missed = store.history(session, last_seen, self.threshold + 1).await?;

        if missed.is_empty() {
            return Ok(CatchUpPlan::UpToDate);
        }
        if missed.len() <= self.threshold {
            return Ok(CatchUpPlan::Diffs(missed));
        }

        match store.refresh(session).await? {
            Some(latest) => Ok(CatchUpPlan::Full(latest)),
            None => Ok(CatchUpPlan::UpToDate),
        }
    }
}
