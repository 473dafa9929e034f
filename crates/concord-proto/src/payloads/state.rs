//! Versioned session state payloads.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{IdentityId, RoomId, SessionId};

/// Propose a transition of a session's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Propose {
    /// Client nonce echoed in the [`ProposalResult`].
    pub request_id: u32,
    /// Session to modify.
    pub session: SessionId,
    /// Room the accepted transition is announced in.
    pub room: RoomId,
    /// Version the candidate was computed against (0 for a new session).
    pub base_version: u64,
    /// Candidate state.
    pub payload: Bytes,
}

/// Read the current state of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchState {
    /// Session to read.
    pub session: SessionId,
}

/// One version of a session's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Session.
    pub session: SessionId,
    /// Room the transition was announced in.
    pub room: RoomId,
    /// Version number, strictly increasing per session.
    pub version: u64,
    /// Full state at this version.
    pub payload: Bytes,
    /// Identity whose proposal produced this version.
    pub modified_by: IdentityId,
    /// Wall-clock commit time in milliseconds since the Unix epoch.
    pub modified_at_ms: u64,
}

/// Why a proposal was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Base version is behind and the candidate cannot be re-derived.
    Stale,
    /// The session's critical section stayed contended.
    Busy,
    /// A dependency is failing; retry later.
    Unavailable,
    /// The session has no state and the base version was not 0.
    NotFound,
}

/// Outcome carried by a [`ProposalResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalOutcome {
    /// Committed at `version`.
    Accepted {
        /// New version.
        version: u64,
        /// The candidate was replayed on a newer base.
        replayed: bool,
    },
    /// Not committed.
    Rejected {
        /// Reason.
        reason: RejectReason,
        /// Authoritative state for stale rejections.
        current: Option<StateSnapshot>,
        /// Retry hint for busy or unavailable rejections.
        retry_after_ms: Option<u64>,
    },
}

/// Answer to a [`Propose`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalResult {
    /// Nonce from the proposal.
    pub request_id: u32,
    /// Session proposed against.
    pub session: SessionId,
    /// Outcome.
    pub outcome: ProposalOutcome,
}

/// Transitions missed while disconnected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchUp {
    /// Session caught up.
    pub session: SessionId,
    /// `records` holds only the latest state instead of every diff.
    pub full: bool,
    /// Versions in ascending order.
    pub records: Vec<StateSnapshot>,
}

/// Reconnection restored the previous context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuityRestored {
    /// Rooms rejoined.
    pub rooms: Vec<RoomId>,
    /// Sessions a catch-up was computed for.
    pub sessions: Vec<SessionId>,
}
