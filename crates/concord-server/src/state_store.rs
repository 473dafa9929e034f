//! Authoritative versioned session state.
//!
//! Durable storage holds the authoritative copy; a TTL cache in front of it
//! serves reads. Every durable call goes through the storage
//! [`ResilienceGuard`], so a failing backend opens the circuit and later
//! calls fail fast with [`SyncError::DependencyUnavailable`].

use std::time::Duration;

use concord_core::{BreakerConfig, BreakerState, Environment, StateRecord, SyncError};
use concord_proto::SessionId;

use crate::{
    cache::StateCache,
    guard::{GuardError, ResilienceGuard},
    storage::{Storage, StorageError},
};

/// Result of a durable write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persisted {
    /// The record is the new head.
    Committed,
    /// The stored head moved; the store would have accepted `expected`.
    Conflict {
        /// Version the store would have accepted.
        expected: u64,
    },
}

/// Durable-first store with a read-through cache.
pub struct StateStore<E: Environment, S: Storage> {
    env: E,
    storage: S,
    cache: StateCache<E::Instant>,
    guard: ResilienceGuard<E>,
}

fn storage_error(error: GuardError<StorageError>) -> SyncError {
    error.into_sync_error(|e| SyncError::Storage(e.to_string()))
}

impl<E: Environment, S: Storage> StateStore<E, S> {
    /// Create a store over `storage` with cache entries living for `ttl`.
    pub fn new(env: E, storage: S, ttl: Duration, breaker: BreakerConfig) -> Self {
        Self {
            guard: ResilienceGuard::new("storage", env.clone(), breaker),
            cache: StateCache::new(ttl),
            env,
            storage,
        }
    }

    /// Underlying durable storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Breaker state of the storage guard.
    pub fn breaker_state(&self) -> BreakerState {
        self.guard.state()
    }

    /// Latest record, cache first.
    ///
    /// # Errors
    ///
    /// - `SyncError::DependencyUnavailable` if the storage circuit is open
    /// - `SyncError::Storage` if the backend failed
    pub async fn current(&self, session_id: &SessionId) -> Result<Option<StateRecord>, SyncError> {
        if let Some(record) = self.cache.get(session_id, self.env.now()) {
            return Ok(Some(record));
        }

        let loaded = self.refresh(session_id).await?;
        Ok(loaded)
    }

    /// Latest record, or `SessionNotFound`.
    ///
    /// # Errors
    ///
    /// - `SyncError::SessionNotFound` if the session has no state
    /// - see [`Self::current`]
    pub async fn get(&self, session_id: &SessionId) -> Result<StateRecord, SyncError> {
        self.current(session_id).await?.ok_or_else(|| SyncError::SessionNotFound(session_id.clone()))
    }

    /// Latest record read from durable storage, bypassing the cache.
    ///
    /// Repopulates the cache with what was read.
    ///
    /// # Errors
    ///
    /// See [`Self::current`].
    pub async fn refresh(&self, session_id: &SessionId) -> Result<Option<StateRecord>, SyncError> {
        let loaded =
            self.guard.call(|| self.storage.load(session_id)).await.map_err(storage_error)?;

        match &loaded {
            Some(record) => self.cache.put(record.clone(), self.env.now()),
            None => self.cache.invalidate(session_id),
        }
        Ok(loaded)
    }

    /// Write `record` durably, then cache it.
    ///
    /// # Errors
    ///
    /// See [`Self::current`]. A lost conditional write is not an error; it is
    /// reported as [`Persisted::Conflict`].
    pub async fn persist(&self, record: &StateRecord) -> Result<Persisted, SyncError> {
        match self.guard.call(|| self.storage.save(record)).await {
            Ok(()) => {
                self.cache.put(record.clone(), self.env.now());
                Ok(Persisted::Committed)
            },
            Err(GuardError::Failed(StorageError::Conflict { expected, .. })) => {
                self.cache.invalidate(&record.session_id);
                Ok(Persisted::Conflict { expected })
            },
            Err(e) => Err(storage_error(e)),
        }
    }

    /// Cache a record committed elsewhere. Never touches durable storage.
    pub fn observe(&self, record: StateRecord) {
        self.cache.put(record, self.env.now());
    }

    /// Stored versions after `after`, ascending, at most `limit`.
    ///
    /// # Errors
    ///
    /// See [`Self::current`].
    pub async fn history(
        &self,
        session_id: &SessionId,
        after: u64,
        limit: usize,
    ) -> Result<Vec<StateRecord>, SyncError> {
        self.guard
            .call(|| self.storage.load_since(session_id, after, limit))
            .await
            .map_err(storage_error)
    }

    /// Drop expired cache entries.
    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired(self.env.now())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use concord_proto::{IdentityId, RoomId};

    use super::*;
    use crate::{
        storage::{ChaoticStorage, MemoryStorage},
        system_env::SystemEnv,
    };

    fn record(version: u64, payload: &'static str) -> StateRecord {
        StateRecord {
            session_id: SessionId::new("g1"),
            room: RoomId::new("game:g1"),
            version,
            payload: Bytes::from_static(payload.as_bytes()),
            modified_by: IdentityId(1),
            modified_at_ms: 0,
        }
    }

    fn store<S: Storage>(storage: S) -> StateStore<SystemEnv, S> {
        StateStore::new(SystemEnv::new(), storage, Duration::from_secs(30), BreakerConfig::default())
    }

    #[tokio::test]
    async fn missing_session_is_not_found() {
        let store = store(MemoryStorage::new());
        assert_eq!(
            store.get(&SessionId::new("g1")).await,
            Err(SyncError::SessionNotFound(SessionId::new("g1")))
        );
    }

    #[tokio::test]
    async fn persist_then_read_from_cache() {
        let storage = MemoryStorage::new();
        let store = store(storage.clone());
        assert_eq!(store.persist(&record(1, "a")).await, Ok(Persisted::Committed));

        // Wipe durable storage: a cached read still answers
        storage.clear();
        assert_eq!(store.get(&SessionId::new("g1")).await, Ok(record(1, "a")));

        // refresh bypasses the cache
        assert_eq!(store.refresh(&SessionId::new("g1")).await, Ok(None));
        assert_eq!(store.current(&SessionId::new("g1")).await, Ok(None));
    }

    #[tokio::test]
    async fn lost_race_reports_conflict() {
        let storage = MemoryStorage::new();
        let store = store(storage.clone());
        storage.save(&record(1, "other node")).await.unwrap();

        assert_eq!(store.persist(&record(1, "a")).await, Ok(Persisted::Conflict { expected: 2 }));
        assert_eq!(store.breaker_state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn failing_storage_opens_circuit() {
        let storage = ChaoticStorage::new(MemoryStorage::new(), 1.0);
        let store = store(storage.clone());

        for _ in 0..5 {
            assert!(matches!(
                store.refresh(&SessionId::new("g1")).await,
                Err(SyncError::Storage(_))
            ));
        }
        assert!(matches!(
            store.refresh(&SessionId::new("g1")).await,
            Err(SyncError::DependencyUnavailable { .. })
        ));
        assert_eq!(storage.operation_count(), 5);
    }
}
