//! Ordered local delivery of committed state.
//!
//! Every accepted version reaches this node's connections through the feed,
//! whether it was committed here or arrived over the bus. Within a session a
//! version is delivered only when it is exactly one past the last delivered
//! version, so no connection ever sees N before N-1.
//!
//! A session the node has never delivered starts at version 0. Anything
//! other than the next version is a gap and is re-read from durable
//! storage: a short contiguous run is delivered version by version, a long
//! one collapses to the latest full state. Classification and delivery
//! happen under the session's entry lock, so concurrent recoveries and bus
//! messages interleave without reordering.
//!
//! The feed also remembers which sessions each room has carried, so a
//! reconnecting client can be caught up on sessions it never saw.

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use concord_core::{Environment, StateRecord};
use concord_proto::{RoomId, SessionId};
use dashmap::{DashMap, mapref::entry::Entry};

use crate::{router::BroadcastRouter, state_store::StateStore, storage::Storage};

/// Where an incoming version sits relative to what this node delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classified {
    /// Exactly one past the last delivered version; it was delivered.
    Next,
    /// At or below the last delivered version.
    Duplicate,
    /// Versions between `current` and the incoming one are missing.
    Gap {
        /// Last version this node delivered.
        current: u64,
    },
}

/// Last delivered version per session.
#[derive(Debug, Default)]
pub struct VersionView {
    versions: DashMap<SessionId, u64>,
}

impl VersionView {
    /// Create an empty view.
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify `version` and, if it is the next one, run `deliver` before
    /// releasing the session.
    pub fn deliver_next(
        &self,
        session_id: &SessionId,
        version: u64,
        deliver: impl FnOnce(),
    ) -> Classified {
        match self.versions.entry(session_id.clone()) {
            Entry::Vacant(vacant) => {
                if version == 1 {
                    deliver();
                    vacant.insert(version);
                    Classified::Next
                } else {
                    Classified::Gap { current: 0 }
                }
            },
            Entry::Occupied(mut occupied) => {
                let current = *occupied.get();
                if version <= current {
                    Classified::Duplicate
                } else if version == current + 1 {
                    deliver();
                    occupied.insert(version);
                    Classified::Next
                } else {
                    Classified::Gap { current }
                }
            },
        }
    }

    /// Jump to `version`, running `deliver` if it is ahead of the view.
    /// Never moves backwards. Returns whether the view moved.
    pub fn deliver_through(
        &self,
        session_id: &SessionId,
        version: u64,
        deliver: impl FnOnce(),
    ) -> bool {
        let mut entry = self.versions.entry(session_id.clone()).or_insert(0);
        if *entry >= version {
            return false;
        }
        deliver();
        *entry = version;
        true
    }

    /// Last delivered version, 0 if none.
    pub fn current(&self, session_id: &SessionId) -> u64 {
        self.versions.get(session_id).map_or(0, |v| *v)
    }

    /// Every session with a delivered version.
    pub fn sessions(&self) -> Vec<SessionId> {
        self.versions.iter().map(|entry| entry.key().clone()).collect()
    }
}

/// In-order delivery of state records to local room members.
pub struct StateFeed<E: Environment, S: Storage> {
    view: VersionView,
    room_sessions: DashMap<RoomId, HashSet<SessionId>>,
    store: Arc<StateStore<E, S>>,
    router: Arc<BroadcastRouter<E>>,
    catch_up_threshold: usize,
    gaps: AtomicU64,
}

impl<E: Environment, S: Storage> StateFeed<E, S> {
    /// Create a feed that recovers gaps from `store`.
    pub fn new(
        store: Arc<StateStore<E, S>>,
        router: Arc<BroadcastRouter<E>>,
        catch_up_threshold: usize,
    ) -> Self {
        Self {
            view: VersionView::new(),
            room_sessions: DashMap::new(),
            store,
            router,
            catch_up_threshold,
            gaps: AtomicU64::new(0),
        }
    }

    /// Delivery view.
    pub fn view(&self) -> &VersionView {
        &self.view
    }

    /// Gaps recovered from durable storage so far.
    pub fn gaps(&self) -> u64 {
        self.gaps.load(Ordering::Relaxed)
    }

    /// Sessions whose records were carried by `room`.
    pub fn sessions_in(&self, room: &RoomId) -> Vec<SessionId> {
        self.room_sessions
            .get(room)
            .map(|sessions| sessions.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Deliver `record` if it is the next version of its session.
    ///
    /// Never waits; a gap is reported and left to [`Self::recover_gap`].
    pub fn offer(&self, record: &StateRecord) -> Classified {
        self.room_sessions
            .entry(record.room.clone())
            .or_default()
            .insert(record.session_id.clone());

        self.view.deliver_next(&record.session_id, record.version, || {
            self.store.observe(record.clone());
            self.router.deliver_state(record);
        })
    }

    /// [`Self::offer`], recovering a gap from durable storage before
    /// returning.
    pub async fn accept(&self, record: &StateRecord) -> Classified {
        let classified = self.offer(record);
        match classified {
            Classified::Gap { current } => {
                self.recover_gap(&record.session_id, current, record.version).await;
            },
            Classified::Duplicate => {
                tracing::debug!(
                    session_id = %record.session_id,
                    version = record.version,
                    "duplicate state message"
                );
            },
            Classified::Next => {},
        }
        classified
    }

    /// Version `received` arrived while the view was at `current`: deliver
    /// the missing run from durable storage.
    pub async fn recover_gap(&self, session_id: &SessionId, current: u64, received: u64) {
        self.gaps.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            session_id = %session_id,
            current,
            received,
            "version gap, re-fetching from storage"
        );
        self.fill_from_storage(session_id, current).await;
    }

    async fn fill_from_storage(&self, session_id: &SessionId, current: u64) {
        let missed =
            match self.store.history(session_id, current, self.catch_up_threshold + 1).await {
                Ok(missed) => missed,
                Err(e) => {
                    tracing::error!(session_id = %session_id, error = %e, "gap recovery failed");
                    return;
                },
            };

        if missed.len() <= self.catch_up_threshold {
            for record in &missed {
                self.offer(record);
            }
            return;
        }

        match self.store.refresh(session_id).await {
            Ok(Some(latest)) => {
                self.room_sessions
                    .entry(latest.room.clone())
                    .or_default()
                    .insert(session_id.clone());
                self.view.deliver_through(session_id, latest.version, || {
                    self.router.deliver_state(&latest);
                });
            },
            Ok(None) => {},
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "gap recovery failed");
            },
        }
    }

    /// Re-read every known session from durable storage and deliver what the
    /// view missed. Run after the bus may have dropped messages.
    pub async fn resync(&self) {
        let sessions = self.view.sessions();
        tracing::info!(sessions = sessions.len(), "resynchronizing state from storage");
        for session_id in sessions {
            let current = self.view.current(&session_id);
            self.fill_from_storage(&session_id, current).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use concord_core::{BreakerConfig, ConnectionConfig};
    use concord_proto::{IdentityId, Payload, Role, RoomKind};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        registry::ConnectionRegistry,
        room_manager::RoomManager,
        storage::MemoryStorage,
        test_env::ManualEnv,
    };

    struct Fixture {
        feed: StateFeed<ManualEnv, MemoryStorage>,
        storage: MemoryStorage,
        watcher: mpsc::Receiver<Payload>,
    }

    fn record(session: &SessionId, version: u64) -> StateRecord {
        StateRecord {
            session_id: session.clone(),
            room: RoomId::game(session),
            version,
            payload: Bytes::from(vec![version as u8]),
            modified_by: IdentityId(1),
            modified_at_ms: 0,
        }
    }

    fn fixture(session: &SessionId, threshold: usize) -> Fixture {
        let env = ManualEnv::new();
        let storage = MemoryStorage::new();
        let registry = Arc::new(ConnectionRegistry::new(env.clone(), ConnectionConfig::default()));
        let rooms = Arc::new(RoomManager::new(env.clone()));
        let router = Arc::new(BroadcastRouter::new(
            env.clone(),
            Arc::clone(&registry),
            Arc::clone(&rooms),
            Duration::from_millis(25),
            CancellationToken::new(),
            None,
        ));
        let store = Arc::new(StateStore::new(
            env,
            storage.clone(),
            Duration::from_secs(60),
            BreakerConfig::default(),
        ));

        let reg = registry.register(Some(IdentityId(5)), Role::Spectator).unwrap();
        let (tx, watcher) = mpsc::channel(64);
        router.attach(reg.connection_id, tx);
        rooms.join(reg.connection_id, &RoomId::game(session), RoomKind::Game);

        Fixture { feed: StateFeed::new(store, router, threshold), storage, watcher }
    }

    fn delivered(rx: &mut mpsc::Receiver<Payload>) -> Vec<u64> {
        let mut versions = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            if let Payload::StateChanged(snapshot) = payload {
                versions.push(snapshot.version);
            }
        }
        versions
    }

    #[test]
    fn version_classification() {
        let view = VersionView::new();
        let g1 = SessionId::new("g1");

        assert_eq!(view.deliver_next(&g1, 4, || {}), Classified::Gap { current: 0 });
        assert_eq!(view.deliver_next(&g1, 1, || {}), Classified::Next);
        assert_eq!(view.deliver_next(&g1, 2, || {}), Classified::Next);
        assert_eq!(view.deliver_next(&g1, 2, || {}), Classified::Duplicate);
        assert_eq!(view.deliver_next(&g1, 5, || {}), Classified::Gap { current: 2 });
        assert_eq!(view.current(&g1), 2);

        assert!(view.deliver_through(&g1, 8, || {}));
        assert!(!view.deliver_through(&g1, 3, || panic!("must not deliver behind the view")));
        assert_eq!(view.current(&g1), 8);
    }

    #[tokio::test]
    async fn first_version_out_of_order_is_filled_from_storage() {
        let session = SessionId::new("g1");
        let mut f = fixture(&session, 16);
        for version in 1..=3 {
            f.storage.save(&record(&session, version)).await.unwrap();
        }

        assert_eq!(f.feed.accept(&record(&session, 3)).await, Classified::Gap { current: 0 });
        assert_eq!(f.feed.accept(&record(&session, 2)).await, Classified::Duplicate);

        assert_eq!(delivered(&mut f.watcher), vec![1, 2, 3]);
        assert_eq!(f.feed.gaps(), 1);
    }

    #[tokio::test]
    async fn long_gap_collapses_to_latest() {
        let session = SessionId::new("g1");
        let mut f = fixture(&session, 2);
        for version in 1..=6 {
            f.storage.save(&record(&session, version)).await.unwrap();
        }

        f.feed.accept(&record(&session, 6)).await;
        assert_eq!(delivered(&mut f.watcher), vec![6]);
        assert_eq!(f.feed.view().current(&session), 6);
    }

    #[tokio::test]
    async fn resync_delivers_versions_the_view_missed() {
        let session = SessionId::new("g1");
        let mut f = fixture(&session, 16);
        f.storage.save(&record(&session, 1)).await.unwrap();
        f.feed.accept(&record(&session, 1)).await;

        for version in 2..=4 {
            f.storage.save(&record(&session, version)).await.unwrap();
        }
        f.feed.resync().await;

        assert_eq!(delivered(&mut f.watcher), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn rooms_remember_their_sessions() {
        let session = SessionId::new("g1");
        let f = fixture(&session, 16);
        assert!(f.feed.sessions_in(&RoomId::game(&session)).is_empty());

        f.feed.offer(&record(&session, 1));
        assert_eq!(f.feed.sessions_in(&RoomId::game(&session)), vec![session.clone()]);
        assert!(f.feed.sessions_in(&RoomId::lobby("chess")).is_empty());
    }
}
