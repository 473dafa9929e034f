//! Storage error types.

use concord_proto::SessionId;
use thiserror::Error;

use crate::guard::DependencyFailure;

/// Errors that can occur during storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Conditional write rejected: the stored head moved.
    ///
    /// This is a logical outcome of a lost race, not a storage failure.
    #[error("version conflict for session {session_id}: expected {expected}, got {got}")]
    Conflict {
        /// Session written to.
        session_id: SessionId,
        /// Version the store would have accepted.
        expected: u64,
        /// Version that was offered.
        got: u64,
    },

    /// Underlying storage failed (disk, database, network).
    #[error("storage I/O error: {0}")]
    Io(String),

    /// A stored record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

impl DependencyFailure for StorageError {
    fn is_dependency_failure(&self) -> bool {
        self.is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_not_transient() {
        let conflict =
            StorageError::Conflict { session_id: SessionId::new("g1"), expected: 6, got: 6 };
        assert!(!conflict.is_transient());
        assert!(StorageError::Io("disk full".to_owned()).is_transient());
    }
}
