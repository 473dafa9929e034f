//! In-memory storage implementation
//!
//! Keeps every version of every session in a concurrent map. The conditional
//! write runs under the session's map entry lock, so concurrent writers to
//! the same session are serialized while other sessions proceed.

use std::sync::Arc;

use async_trait::async_trait;
use concord_core::StateRecord;
use concord_proto::SessionId;
use dashmap::{DashMap, mapref::entry::Entry};

use super::{Storage, StorageError};

/// In-memory storage for testing and single-node deployments
#[derive(Clone, Default)]
pub struct MemoryStorage {
    sessions: Arc<DashMap<SessionId, Vec<StateRecord>>>,
}

impl MemoryStorage {
    /// Create empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored versions of a session.
    pub fn version_count(&self, session_id: &SessionId) -> usize {
        self.sessions.get(session_id).map_or(0, |history| history.len())
    }

    /// Drop everything. Simulates losing the storage backend.
    pub fn clear(&self) {
        self.sessions.clear();
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save(&self, record: &StateRecord) -> Result<(), StorageError> {
        let conflict = |expected| StorageError::Conflict {
            session_id: record.session_id.clone(),
            expected,
            got: record.version,
        };

        match self.sessions.entry(record.session_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let history = occupied.get_mut();
                let expected = history.last().map_or(1, |head| head.version + 1);
                if record.version != expected {
                    return Err(conflict(expected));
                }
                history.push(record.clone());
            },
            Entry::Vacant(vacant) => {
                if record.version != 1 {
                    return Err(conflict(1));
                }
                vacant.insert(vec![record.clone()]);
            },
        }

        Ok(())
    }

    async fn load(&self, session_id: &SessionId) -> Result<Option<StateRecord>, StorageError> {
        Ok(self.sessions.get(session_id).and_then(|history| history.last().cloned()))
    }

    async fn load_since(
        &self,
        session_id: &SessionId,
        after: u64,
        limit: usize,
    ) -> Result<Vec<StateRecord>, StorageError> {
        let Some(history) = self.sessions.get(session_id) else {
            return Ok(Vec::new());
        };

        // Versions are dense and start at 1, so version v sits at index v - 1
        let start = usize::try_from(after).unwrap_or(usize::MAX).min(history.len());
        Ok(history[start..].iter().take(limit).cloned().collect())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionId>, StorageError> {
        Ok(self.sessions.iter().map(|entry| entry.key().clone()).collect())
    }
}
