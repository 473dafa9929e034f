//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. Every
//! version of every session survives server restarts. Redb is synchronous,
//! so each call runs on tokio's blocking pool.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use concord_core::StateRecord;
use concord_proto::SessionId;
use redb::{Database, ReadableTable, TableDefinition};

use super::{Storage, StorageError};

/// Table: states
/// Key: session id length (u16 BE) + session id bytes + version (u64 BE)
/// Value: CBOR-encoded StateRecord
const STATES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("states");

/// Table: heads
/// Key: session id bytes
/// Value: latest stored version
const HEADS: TableDefinition<&[u8], u64> = TableDefinition::new("heads");

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

fn io(e: impl std::fmt::Display) -> StorageError {
    StorageError::Io(e.to_string())
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        let txn = db.begin_write().map_err(io)?;
        {
            let _ = txn.open_table(STATES).map_err(io)?;
            let _ = txn.open_table(HEADS).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StorageError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(|e| StorageError::Io(format!("storage task failed: {e}")))?
    }
}

fn encode_state_key(session_id: &SessionId, version: u64) -> Vec<u8> {
    let id = session_id.as_str().as_bytes();
    let mut key = Vec::with_capacity(2 + id.len() + 8);
    key.extend_from_slice(&(id.len() as u16).to_be_bytes());
    key.extend_from_slice(id);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

fn encode_record(record: &StateRecord) -> Result<Vec<u8>, StorageError> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(record, &mut buf)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn decode_record(bytes: &[u8]) -> Result<StateRecord, StorageError> {
    ciborium::de::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn save_record(db: &Database, record: &StateRecord) -> Result<(), StorageError> {
    let head_key = record.session_id.as_str().as_bytes();
    let value = encode_record(record)?;

    let txn = db.begin_write().map_err(io)?;
    {
        let mut heads = txn.open_table(HEADS).map_err(io)?;
        let head = heads.get(head_key).map_err(io)?.map(|guard| guard.value());

        let expected = head.map_or(1, |version| version + 1);
        if record.version != expected {
            return Err(StorageError::Conflict {
                session_id: record.session_id.clone(),
                expected,
                got: record.version,
            });
        }

        let mut states = txn.open_table(STATES).map_err(io)?;
        let key = encode_state_key(&record.session_id, record.version);
        states.insert(key.as_slice(), value.as_slice()).map_err(io)?;
        heads.insert(head_key, record.version).map_err(io)?;
    }
    txn.commit().map_err(io)?;

    Ok(())
}

fn load_head(db: &Database, session_id: &SessionId) -> Result<Option<StateRecord>, StorageError> {
    let txn = db.begin_read().map_err(io)?;
    let heads = txn.open_table(HEADS).map_err(io)?;

    let Some(version) = heads.get(session_id.as_str().as_bytes()).map_err(io)?.map(|g| g.value())
    else {
        return Ok(None);
    };

    let states = txn.open_table(STATES).map_err(io)?;
    let key = encode_state_key(session_id, version);
    match states.get(key.as_slice()).map_err(io)? {
        Some(bytes) => decode_record(bytes.value()).map(Some),
        None => Err(StorageError::Io(format!(
            "head of {session_id} points at missing version {version}"
        ))),
    }
}

fn load_range(
    db: &Database,
    session_id: &SessionId,
    after: u64,
    limit: usize,
) -> Result<Vec<StateRecord>, StorageError> {
    if after == u64::MAX || limit == 0 {
        return Ok(Vec::new());
    }

    let txn = db.begin_read().map_err(io)?;
    let states = txn.open_table(STATES).map_err(io)?;

    let start = encode_state_key(session_id, after + 1);
    let end = encode_state_key(session_id, u64::MAX);

    let mut records = Vec::new();
    for entry in states.range(start.as_slice()..=end.as_slice()).map_err(io)?.take(limit) {
        let (_, value) = entry.map_err(io)?;
        records.push(decode_record(value.value())?);
    }

    Ok(records)
}

fn list_heads(db: &Database) -> Result<Vec<SessionId>, StorageError> {
    let txn = db.begin_read().map_err(io)?;
    let heads = txn.open_table(HEADS).map_err(io)?;

    let mut sessions = Vec::new();
    for entry in heads.iter().map_err(io)? {
        let (key, _) = entry.map_err(io)?;
        let name = String::from_utf8(key.value().to_vec())
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        sessions.push(SessionId::new(name));
    }

    Ok(sessions)
}

#[async_trait]
impl Storage for RedbStorage {
    async fn save(&self, record: &StateRecord) -> Result<(), StorageError> {
        let record = record.clone();
        self.blocking(move |db| save_record(db, &record)).await
    }

    async fn load(&self, session_id: &SessionId) -> Result<Option<StateRecord>, StorageError> {
        let session_id = session_id.clone();
        self.blocking(move |db| load_head(db, &session_id)).await
    }

    async fn load_since(
        &self,
        session_id: &SessionId,
        after: u64,
        limit: usize,
    ) -> Result<Vec<StateRecord>, StorageError> {
        let session_id = session_id.clone();
        self.blocking(move |db| load_range(db, &session_id, after, limit)).await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionId>, StorageError> {
        self.blocking(list_heads).await
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use concord_proto::{IdentityId, RoomId};
    use tempfile::tempdir;

    use super::*;

    fn record(session: &str, version: u64) -> StateRecord {
        StateRecord {
            session_id: SessionId::new(session),
            room: RoomId::new(format!("game:{session}")),
            version,
            payload: Bytes::from(format!("{session}@{version}")),
            modified_by: IdentityId(9),
            modified_at_ms: 1_000 + version,
        }
    }

    #[tokio::test]
    async fn conditional_write() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("state.redb")).unwrap();

        storage.save(&record("g1", 1)).await.unwrap();
        assert!(matches!(
            storage.save(&record("g1", 1)).await,
            Err(StorageError::Conflict { expected: 2, got: 1, .. })
        ));
        assert!(matches!(
            storage.save(&record("g1", 3)).await,
            Err(StorageError::Conflict { expected: 2, got: 3, .. })
        ));
        storage.save(&record("g1", 2)).await.unwrap();

        assert_eq!(storage.load(&SessionId::new("g1")).await.unwrap(), Some(record("g1", 2)));
    }

    #[tokio::test]
    async fn sessions_do_not_overlap() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("state.redb")).unwrap();

        // "g1" is a prefix of "g10"; the length prefix keeps their ranges apart
        for v in 1..=3 {
            storage.save(&record("g1", v)).await.unwrap();
            storage.save(&record("g10", v)).await.unwrap();
        }

        let since = storage.load_since(&SessionId::new("g1"), 1, 10).await.unwrap();
        assert_eq!(since, vec![record("g1", 2), record("g1", 3)]);

        let mut sessions = storage.list_sessions().await.unwrap();
        sessions.sort();
        assert_eq!(sessions, vec![SessionId::new("g1"), SessionId::new("g10")]);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.redb");

        {
            let storage = RedbStorage::open(&path).unwrap();
            for v in 1..=4 {
                storage.save(&record("g1", v)).await.unwrap();
            }
        }

        let reopened = RedbStorage::open(&path).unwrap();
        assert_eq!(reopened.load(&SessionId::new("g1")).await.unwrap(), Some(record("g1", 4)));
        reopened.save(&record("g1", 5)).await.unwrap();
        assert_eq!(reopened.load_since(&SessionId::new("g1"), 3, 10).await.unwrap().len(), 2);
    }
}
