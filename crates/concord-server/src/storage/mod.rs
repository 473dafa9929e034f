//! Durable storage for versioned session state.
//!
//! The durable store holds the authoritative copy of every session. Writes
//! are conditional on the stored head so that version uniqueness holds across
//! processes even though the resolver's critical section is per process.

mod chaotic;
mod error;
mod memory;
mod redb;

use async_trait::async_trait;
pub use chaotic::ChaoticStorage;
use concord_core::StateRecord;
use concord_proto::SessionId;
pub use error::StorageError;
pub use memory::MemoryStorage;

pub use self::redb::RedbStorage;

/// Durable storage abstraction
///
/// Must be Clone (shared by the state store, propagator and recovery tools)
/// and Send + Sync. Implementations share internal state via Arc, so clones
/// access the same underlying storage.
#[async_trait]
pub trait Storage: Clone + Send + Sync + 'static {
    /// Persist `record` as the next version of its session.
    ///
    /// # Invariants
    ///
    /// - Pre: `record.version` equals the stored head + 1 (1 for a session
    ///   with no state)
    /// - Post: `record` is the new head and is retained in history
    ///
    /// # Errors
    ///
    /// - `StorageError::Conflict` if the precondition does not hold
    async fn save(&self, record: &StateRecord) -> Result<(), StorageError>;

    /// Latest record of a session. `None` if the session has no state.
    async fn load(&self, session_id: &SessionId) -> Result<Option<StateRecord>, StorageError>;

    /// Records with `version > after`, ascending, at most `limit` of them.
    async fn load_since(
        &self,
        session_id: &SessionId,
        after: u64,
        limit: usize,
    ) -> Result<Vec<StateRecord>, StorageError>;

    /// Every session with at least one stored version.
    async fn list_sessions(&self) -> Result<Vec<SessionId>, StorageError>;
}
