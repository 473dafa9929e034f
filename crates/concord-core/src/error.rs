//! Error taxonomy shared by every synchronization component.
//!
//! Every rejection is attributable to the caller that triggered it. Benign
//! duplicates (joining a room twice, leaving a room never joined) are not
//! errors; they are reported as outcome variants by the room manager.

use std::time::Duration;

use concord_proto::{ConnectionId, ErrorPayload, RoomId, SessionId};
use thiserror::Error;

use crate::state::StateRecord;

/// Synchronization-layer errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// No verified identity accompanied a registration.
    #[error("identity unauthenticated")]
    IdentityUnauthenticated,

    /// Proposal was based on an outdated version and could not be re-derived.
    #[error("stale proposal for session {session_id}: current version is {}", current.version)]
    StaleProposal {
        /// Session proposed against.
        session_id: SessionId,
        /// Authoritative record the caller should rebase on.
        current: Box<StateRecord>,
    },

    /// The session's critical section could not be acquired in time.
    #[error("session {session_id} busy after {waited:?}")]
    Busy {
        /// Contended session.
        session_id: SessionId,
        /// How long the caller waited.
        waited: Duration,
    },

    /// An external dependency is failing; the circuit is open.
    #[error("{dependency} unavailable, retry after {retry_after:?}")]
    DependencyUnavailable {
        /// Name of the failing dependency.
        dependency: String,
        /// Earliest time a retry may succeed.
        retry_after: Duration,
    },

    /// Room does not exist on this node.
    #[error("room not found: {0}")]
    RoomNotFound(RoomId),

    /// Session has no state and the proposal did not start at version 0.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// Connection is not registered.
    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// Durable storage failed with a non-transient error.
    #[error("storage error: {0}")]
    Storage(String),
}

impl SyncError {
    /// Whether the caller may retry immediately with the same input.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    /// Whether the error signals degraded service rather than a bad request.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::DependencyUnavailable { .. } | Self::Storage(_))
    }

    /// Retry hint, if the error carries one.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Busy { waited, .. } => Some(*waited),
            Self::DependencyUnavailable { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Client-facing error payload.
    #[must_use]
    pub fn to_payload(&self) -> ErrorPayload {
        let code = match self {
            Self::IdentityUnauthenticated => ErrorPayload::UNAUTHENTICATED,
            Self::StaleProposal { .. } => ErrorPayload::STALE_PROPOSAL,
            Self::Busy { .. } => ErrorPayload::BUSY,
            Self::DependencyUnavailable { .. } => ErrorPayload::DEPENDENCY_UNAVAILABLE,
            Self::RoomNotFound(_) => ErrorPayload::ROOM_NOT_FOUND,
            Self::SessionNotFound(_) => ErrorPayload::SESSION_NOT_FOUND,
            Self::ConnectionNotFound(_) | Self::Storage(_) => ErrorPayload::INTERNAL,
        };

        let payload = ErrorPayload::new(code, self.to_string());
        match self.retry_after() {
            Some(after) => payload.with_retry_after_ms(after.as_millis() as u64),
            None => payload,
        }
    }
}
