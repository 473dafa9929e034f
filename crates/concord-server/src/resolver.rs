//! Conflict resolver: arbitrates racing proposals for one session.
//!
//! # Algorithm
//!
//! Every proposal runs inside its session's critical section (a
//! `tokio::sync::Mutex` looked up in a concurrent map), so at most one
//! resolution per session is in flight on this node while other sessions
//! proceed in parallel.
//!
//! 1. Read the current record (cache first).
//! 2. If `base_version == current`, write version `base + 1` durably.
//! 3. On a version mismatch, or when the durable conditional write reports
//!    that another process moved the head, re-read from durable storage and:
//!    - `base == fresh`: the cache was stale, commit on the fresh head
//!    - `base < fresh`: ask the domain rules to re-derive the candidate on top
//!      of the fresh record; commit the result, or reject as stale
//!    - `base > fresh`: reject (the client claims a version that never existed)
//! 4. The commit callback runs after the durable write, still inside the
//!    section, so broadcasts leave in commit order.
//!
//! A proposal that cannot enter the section within the lock timeout fails
//! with [`SyncError::Busy`].

use std::{sync::Arc, time::Duration};

use concord_core::{ABSENT_VERSION, Environment, Proposal, SessionRules, StateRecord, SyncError};
use concord_proto::SessionId;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::{
    state_store::{Persisted, StateStore},
    storage::Storage,
};

/// A proposal that became the authoritative next version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    /// The committed record.
    pub record: StateRecord,
    /// Whether the candidate was re-derived on a newer base.
    pub replayed: bool,
}

type Sections = DashMap<SessionId, Arc<Mutex<()>>>;

/// Per-session compare-and-swap over the state store.
pub struct ConflictResolver<E: Environment, S: Storage> {
    env: E,
    store: Arc<StateStore<E, S>>,
    rules: Arc<dyn SessionRules>,
    sections: Sections,
    lock_timeout: Duration,
}

/// Removes a session's mutex from the map once nobody references it.
struct SectionLease<'a> {
    sections: &'a Sections,
    session_id: SessionId,
}

impl Drop for SectionLease<'_> {
    fn drop(&mut self) {
        self.sections.remove_if(&self.session_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl<E: Environment, S: Storage> ConflictResolver<E, S> {
    /// Create a resolver over `store`, consulting `rules` for re-derivation.
    pub fn new(
        env: E,
        store: Arc<StateStore<E, S>>,
        rules: Arc<dyn SessionRules>,
        lock_timeout: Duration,
    ) -> Self {
        Self { env, store, rules, sections: DashMap::new(), lock_timeout }
    }

    /// State store the resolver writes through.
    pub fn store(&self) -> &Arc<StateStore<E, S>> {
        &self.store
    }

    /// Number of sessions with a live critical section.
    pub fn active_sections(&self) -> usize {
        self.sections.len()
    }

    fn lease(&self, session_id: &SessionId) -> (SectionLease<'_>, Arc<Mutex<()>>) {
        let lock = Arc::clone(&self.sections.entry(session_id.clone()).or_default());
        (SectionLease { sections: &self.sections, session_id: session_id.clone() }, lock)
    }

    /// Resolve `proposal` and, if accepted, call `on_commit` with the new
    /// record before releasing the session.
    ///
    /// # Errors
    ///
    /// - `SyncError::Busy` if the session stayed locked past the lock timeout
    /// - `SyncError::StaleProposal` if the base is outdated and the rules do
    ///   not re-derive it
    /// - `SyncError::SessionNotFound` if the session has no state and the base
    ///   is not 0
    /// - `SyncError::DependencyUnavailable` or `SyncError::Storage` if durable
    ///   storage is failing
    pub async fn propose<F>(&self, proposal: Proposal, on_commit: F) -> Result<Accepted, SyncError>
    where
        F: FnOnce(&StateRecord) + Send,
    {
        let (_lease, lock) = self.lease(&proposal.session_id);
        let _held = tokio::select! {
            held = lock.lock_owned() => held,
            () = self.env.sleep(self.lock_timeout) => {
                tracing::warn!(session_id = %proposal.session_id, "session busy");
                return Err(SyncError::Busy {
                    session_id: proposal.session_id,
                    waited: self.lock_timeout,
                });
            },
        };

        let accepted = self.resolve(&proposal).await?;
        on_commit(&accepted.record);

        tracing::debug!(
            session_id = %proposal.session_id,
            version = accepted.record.version,
            replayed = accepted.replayed,
            "proposal accepted"
        );
        Ok(accepted)
    }

    async fn resolve(&self, proposal: &Proposal) -> Result<Accepted, SyncError> {
        let current = self.store.current(&proposal.session_id).await?;
        let current_version = current.as_ref().map_or(ABSENT_VERSION, |r| r.version);

        if proposal.base_version == current_version {
            if let Some(record) = self.commit(proposal, proposal.base_version, None).await? {
                return Ok(Accepted { record, replayed: false });
            }
        }

        self.rebase(proposal).await
    }

    /// Slow path: re-read the authoritative head and re-derive once.
    async fn rebase(&self, proposal: &Proposal) -> Result<Accepted, SyncError> {
        let fresh = self.store.refresh(&proposal.session_id).await?;
        let fresh_version = fresh.as_ref().map_or(ABSENT_VERSION, |r| r.version);

        if proposal.base_version > fresh_version {
            return Err(self.reject(proposal, fresh));
        }

        let (payload, replayed) = if proposal.base_version == fresh_version {
            (None, false)
        } else {
            let Some(head) = fresh.as_ref() else {
                return Err(SyncError::SessionNotFound(proposal.session_id.clone()));
            };
            match self.rules.rederive(head, proposal) {
                Some(payload) => (Some(payload), true),
                None => return Err(self.reject(proposal, fresh)),
            }
        };

        match self.commit(proposal, fresh_version, payload).await? {
            Some(record) => Ok(Accepted { record, replayed }),
            None => {
                // Lost a second race against another process
                let head = self.store.refresh(&proposal.session_id).await?;
                Err(self.reject(proposal, head))
            },
        }
    }

    /// Write version `base + 1`. `None` if the durable head moved.
    async fn commit(
        &self,
        proposal: &Proposal,
        base: u64,
        payload: Option<bytes::Bytes>,
    ) -> Result<Option<StateRecord>, SyncError> {
        let record = StateRecord {
            session_id: proposal.session_id.clone(),
            room: proposal.room.clone(),
            version: base + 1,
            payload: payload.unwrap_or_else(|| proposal.payload.clone()),
            modified_by: proposal.identity,
            modified_at_ms: self.env.wall_clock_millis(),
        };

        match self.store.persist(&record).await? {
            Persisted::Committed => Ok(Some(record)),
            Persisted::Conflict { expected } => {
                tracing::debug!(
                    session_id = %record.session_id,
                    offered = record.version,
                    expected,
                    "durable head moved"
                );
                Ok(None)
            },
        }
    }

    fn reject(&self, proposal: &Proposal, head: Option<StateRecord>) -> SyncError {
        match head {
            Some(current) => {
                tracing::warn!(
                    session_id = %proposal.session_id,
                    base_version = proposal.base_version,
                    current_version = current.version,
                    "stale proposal"
                );
                SyncError::StaleProposal {
                    session_id: proposal.session_id.clone(),
                    current: Box::new(current),
                }
            },
            None => SyncError::SessionNotFound(proposal.session_id.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use concord_core::{BreakerConfig, StrictRules};
    use concord_proto::{IdentityId, RoomId};

    use super::*;
    use crate::{storage::MemoryStorage, test_env::ManualEnv};

    fn resolver_with(
        storage: MemoryStorage,
        rules: Arc<dyn SessionRules>,
    ) -> ConflictResolver<ManualEnv, MemoryStorage> {
        let env = ManualEnv::new();
        let store = Arc::new(StateStore::new(
            env.clone(),
            storage,
            Duration::from_secs(30),
            BreakerConfig::default(),
        ));
        ConflictResolver::new(env, store, rules, Duration::from_millis(50))
    }

    fn proposal(identity: u64, base: u64, payload: &'static str) -> Proposal {
        Proposal {
            session_id: SessionId::new("g1"),
            room: RoomId::new("game:g1"),
            identity: IdentityId(identity),
            base_version: base,
            payload: Bytes::from_static(payload.as_bytes()),
        }
    }

    async fn seed(resolver: &ConflictResolver<ManualEnv, MemoryStorage>, versions: u64) {
        for base in 0..versions {
            resolver.propose(proposal(1, base, "seed"), |_| {}).await.unwrap();
        }
    }

    /// Accepts anything, appending a marker so replays are visible.
    struct Rebase;

    impl SessionRules for Rebase {
        fn rederive(&self, current: &StateRecord, proposal: &Proposal) -> Option<Bytes> {
            let mut merged = current.payload.to_vec();
            merged.extend_from_slice(b"+");
            merged.extend_from_slice(&proposal.payload);
            Some(Bytes::from(merged))
        }
    }

    #[tokio::test]
    async fn base_zero_creates_version_one() {
        let resolver = resolver_with(MemoryStorage::new(), Arc::new(StrictRules));
        let accepted = resolver.propose(proposal(1, 0, "start"), |_| {}).await.unwrap();

        assert_eq!(accepted.record.version, 1);
        assert!(!accepted.replayed);
        assert_eq!(resolver.active_sections(), 0);
    }

    #[tokio::test]
    async fn unknown_session_with_nonzero_base_is_not_found() {
        let resolver = resolver_with(MemoryStorage::new(), Arc::new(StrictRules));
        assert_eq!(
            resolver.propose(proposal(1, 3, "x"), |_| {}).await,
            Err(SyncError::SessionNotFound(SessionId::new("g1")))
        );
    }

    #[tokio::test]
    async fn stale_proposal_carries_current_record() {
        let resolver = resolver_with(MemoryStorage::new(), Arc::new(StrictRules));
        seed(&resolver, 6).await;

        let err = resolver.propose(proposal(2, 5, "late"), |_| {}).await.unwrap_err();
        let SyncError::StaleProposal { current, .. } = err else {
            panic!("expected stale proposal, got {err:?}");
        };
        assert_eq!(current.version, 6);
    }

    #[tokio::test]
    async fn rederivable_proposal_is_replayed() {
        let resolver = resolver_with(MemoryStorage::new(), Arc::new(Rebase));
        seed(&resolver, 6).await;

        let accepted = resolver.propose(proposal(2, 5, "late"), |_| {}).await.unwrap();
        assert_eq!(accepted.record.version, 7);
        assert!(accepted.replayed);
        assert_eq!(accepted.record.payload, Bytes::from_static(b"seed+late"));
    }

    #[tokio::test]
    async fn write_from_another_process_is_detected() {
        let storage = MemoryStorage::new();
        let resolver = resolver_with(storage.clone(), Arc::new(StrictRules));
        seed(&resolver, 1).await;

        // Another node commits version 2; our cache still says 1
        let mut foreign = resolver.store().get(&SessionId::new("g1")).await.unwrap();
        foreign.version = 2;
        foreign.payload = Bytes::from_static(b"foreign");
        storage.save(&foreign).await.unwrap();

        let err = resolver.propose(proposal(2, 1, "mine"), |_| {}).await.unwrap_err();
        assert!(matches!(err, SyncError::StaleProposal { ref current, .. } if current.version == 2));
        assert_eq!(storage.version_count(&SessionId::new("g1")), 2);
    }

    #[tokio::test]
    async fn commit_callback_runs_once_per_acceptance() {
        let resolver = resolver_with(MemoryStorage::new(), Arc::new(StrictRules));
        let calls = AtomicUsize::new(0);

        resolver
            .propose(proposal(1, 0, "a"), |record| {
                assert_eq!(record.version, 1);
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        let _ = resolver
            .propose(proposal(1, 0, "b"), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn racing_proposals_at_same_base_accept_exactly_one() {
        let resolver = resolver_with(MemoryStorage::new(), Arc::new(StrictRules));
        seed(&resolver, 5).await;

        let (a, b) = tokio::join!(
            resolver.propose(proposal(1, 5, "alice"), |_| {}),
            resolver.propose(proposal(2, 5, "bob"), |_| {}),
        );

        let (winner, loser) = match (a, b) {
            (Ok(w), Err(l)) | (Err(l), Ok(w)) => (w, l),
            other => panic!("expected one winner, got {other:?}"),
        };
        assert_eq!(winner.record.version, 6);
        let SyncError::StaleProposal { current, .. } = loser else {
            panic!("expected stale proposal, got {loser:?}");
        };
        assert_eq!(current.payload, winner.record.payload);
    }

    #[tokio::test]
    async fn held_section_yields_busy() {
        let resolver = resolver_with(MemoryStorage::new(), Arc::new(StrictRules));
        let (_lease, lock) = resolver.lease(&SessionId::new("g1"));
        let _held = lock.lock().await;

        let err = resolver.propose(proposal(1, 0, "a"), |_| {}).await.unwrap_err();
        assert!(matches!(err, SyncError::Busy { .. }));
        assert!(err.is_retryable());
    }
}
