//! Bounded-TTL cache of the latest record per session.
//!
//! The cache is never authoritative. An entry older than the TTL is removed
//! on access and reported as a miss, so callers fall back to durable storage.

use std::{ops::Sub, time::Duration};

use concord_core::StateRecord;
use concord_proto::SessionId;
use dashmap::DashMap;

struct Entry<I> {
    record: StateRecord,
    stored_at: I,
}

/// Session id → latest known record, with a time-to-live.
pub struct StateCache<I> {
    entries: DashMap<SessionId, Entry<I>>,
    ttl: Duration,
}

impl<I> StateCache<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Create an empty cache whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self { entries: DashMap::new(), ttl }
    }

    /// Fresh entry for `session_id`, if any.
    pub fn get(&self, session_id: &SessionId, now: I) -> Option<StateRecord> {
        let expired = {
            let entry = self.entries.get(session_id)?;
            if now - entry.stored_at <= self.ttl {
                return Some(entry.record.clone());
            }
            entry.stored_at
        };

        // Only drop the entry we judged expired; a concurrent put may have
        // replaced it meanwhile.
        self.entries.remove_if(session_id, |_, entry| entry.stored_at == expired);
        None
    }

    /// Store `record` unless a newer version is already cached.
    pub fn put(&self, record: StateRecord, now: I) {
        self.entries
            .entry(record.session_id.clone())
            .and_modify(|entry| {
                if record.version >= entry.record.version {
                    entry.record = record.clone();
                    entry.stored_at = now;
                }
            })
            .or_insert_with(|| Entry { record: record.clone(), stored_at: now });
    }

    /// Drop the entry for `session_id`.
    pub fn invalidate(&self, session_id: &SessionId) {
        self.entries.remove(session_id);
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn purge_expired(&self, now: I) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| now - entry.stored_at <= self.ttl);
        before.saturating_sub(self.entries.len())
    }

    /// Number of cached sessions, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use bytes::Bytes;
    use concord_proto::{IdentityId, RoomId};

    use super::*;

    fn record(version: u64) -> StateRecord {
        StateRecord {
            session_id: SessionId::new("g1"),
            room: RoomId::new("game:g1"),
            version,
            payload: Bytes::new(),
            modified_by: IdentityId(1),
            modified_at_ms: 0,
        }
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let t0 = Instant::now();
        let cache = StateCache::new(Duration::from_secs(30));
        cache.put(record(1), t0);

        assert_eq!(cache.get(&SessionId::new("g1"), t0 + Duration::from_secs(30)), Some(record(1)));
        assert_eq!(cache.get(&SessionId::new("g1"), t0 + Duration::from_secs(31)), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn older_version_never_replaces_newer() {
        let t0 = Instant::now();
        let cache = StateCache::new(Duration::from_secs(30));
        cache.put(record(5), t0);
        cache.put(record(4), t0 + Duration::from_secs(1));

        assert_eq!(cache.get(&SessionId::new("g1"), t0).map(|r| r.version), Some(5));
    }

    #[test]
    fn purge_removes_only_expired() {
        let t0 = Instant::now();
        let cache = StateCache::new(Duration::from_secs(10));
        cache.put(record(1), t0);

        let mut other = record(1);
        other.session_id = SessionId::new("g2");
        cache.put(other, t0 + Duration::from_secs(8));

        assert_eq!(cache.purge_expired(t0 + Duration::from_secs(12)), 1);
        assert_eq!(cache.len(), 1);
    }
}
