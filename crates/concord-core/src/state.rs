//! Versioned session state and proposals.

use bytes::Bytes;
use concord_proto::{IdentityId, RoomId, SessionId, payloads::state::StateSnapshot};
use serde::{Deserialize, Serialize};

/// Version of a session that has no state yet.
pub const ABSENT_VERSION: u64 = 0;

/// One accepted version of a session's state.
///
/// # Invariants
///
/// - `version >= 1`; version 0 is reserved for "no state".
/// - For a given session no two accepted records share a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Session this record belongs to.
    pub session_id: SessionId,
    /// Room the transition was announced in.
    pub room: RoomId,
    /// Strictly increasing version.
    pub version: u64,
    /// Full state at this version.
    pub payload: Bytes,
    /// Identity whose proposal produced this version.
    pub modified_by: IdentityId,
    /// Wall-clock commit time (ms since the Unix epoch).
    pub modified_at_ms: u64,
}

impl StateRecord {
    /// Wire representation.
    #[must_use]
    pub fn to_snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            session: self.session_id.clone(),
            room: self.room.clone(),
            version: self.version,
            payload: self.payload.clone(),
            modified_by: self.modified_by,
            modified_at_ms: self.modified_at_ms,
        }
    }
}

impl From<StateSnapshot> for StateRecord {
    fn from(snapshot: StateSnapshot) -> Self {
        Self {
            session_id: snapshot.session,
            room: snapshot.room,
            version: snapshot.version,
            payload: snapshot.payload,
            modified_by: snapshot.modified_by,
            modified_at_ms: snapshot.modified_at_ms,
        }
    }
}

/// A candidate transition computed by a client against `base_version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    /// Session to modify.
    pub session_id: SessionId,
    /// Room the accepted transition is announced in.
    pub room: RoomId,
    /// Proposing identity.
    pub identity: IdentityId,
    /// Version the candidate was computed against.
    pub base_version: u64,
    /// Candidate state.
    pub payload: Bytes,
}

/// Domain predicate consulted when a proposal's base is outdated.
///
/// The synchronization layer holds no game rules. When a proposal loses a
/// race, the resolver asks the domain whether the intent behind the candidate
/// still applies to the newer state, and if so what the resulting state is.
pub trait SessionRules: Send + Sync + 'static {
    /// Recompute `proposal` on top of `current`.
    ///
    /// Returns the replacement payload, or `None` if the proposal no longer
    /// makes sense and must be rejected as stale.
    fn rederive(&self, current: &StateRecord, proposal: &Proposal) -> Option<Bytes>;
}

/// Rules under which no outdated proposal is ever re-derivable.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrictRules;

impl SessionRules for StrictRules {
    fn rederive(&self, _current: &StateRecord, _proposal: &Proposal) -> Option<Bytes> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_conversion_is_lossless() {
        let record = StateRecord {
            session_id: SessionId::new("g1"),
            room: RoomId::new("game:g1"),
            version: 4,
            payload: Bytes::from_static(b"x"),
            modified_by: IdentityId(3),
            modified_at_ms: 99,
        };
        assert_eq!(StateRecord::from(record.to_snapshot()), record);
    }

    #[test]
    fn strict_rules_never_rederive() {
        let record = StateRecord {
            session_id: SessionId::new("g1"),
            room: RoomId::new("game:g1"),
            version: 6,
            payload: Bytes::new(),
            modified_by: IdentityId(1),
            modified_at_ms: 0,
        };
        let proposal = Proposal {
            session_id: SessionId::new("g1"),
            room: RoomId::new("game:g1"),
            identity: IdentityId(2),
            base_version: 5,
            payload: Bytes::from_static(b"move"),
        };
        assert_eq!(StrictRules.rederive(&record, &proposal), None);
    }
}
