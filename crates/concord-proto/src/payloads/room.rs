//! Room membership and event delivery payloads.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{IdentityId, Persistence, RoomId, RoomKind};

/// Application event routed through rooms.
///
/// Critical events (state transitions, game endings) are delivered
/// immediately; everything else may be coalesced into a [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Application-defined event type, used to group batched occurrences.
    pub event_type: String,
    /// Opaque event body.
    pub payload: Bytes,
    /// Bypass batching.
    pub critical: bool,
}

impl Event {
    /// Event delivered immediately.
    pub fn critical(event_type: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self { event_type: event_type.into(), payload: payload.into(), critical: true }
    }

    /// Event eligible for batching.
    pub fn batched(event_type: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self { event_type: event_type.into(), payload: payload.into(), critical: false }
    }
}

/// Join a room, creating it with `kind` if it does not exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRoom {
    /// Room to join.
    pub room: RoomId,
    /// Kind used when the join creates the room.
    pub kind: RoomKind,
}

/// Leave a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveRoom {
    /// Room to leave.
    pub room: RoomId,
}

/// Explicit room creation by a session owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRoom {
    /// Room to create.
    pub room: RoomId,
    /// Room kind.
    pub kind: RoomKind,
    /// Overrides the kind's default persistence class.
    pub persistence: Option<Persistence>,
    /// Opaque metadata stored with the room.
    pub metadata: Bytes,
}

/// Acknowledges a join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Joined {
    /// Room joined.
    pub room: RoomId,
    /// The connection was already a member; nothing changed.
    pub already_member: bool,
}

/// Client-published event for a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publish {
    /// Target room.
    pub room: RoomId,
    /// Event to deliver.
    pub event: Event,
    /// Do not echo the event back to the publishing connection.
    pub exclude_self: bool,
}

/// Single event delivered to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deliver {
    /// Room the event was sent to, `None` for identity or global sends.
    pub room: Option<RoomId>,
    /// The event.
    pub event: Event,
}

/// Non-critical events coalesced over one batching window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Room the batch was collected for, `None` for per-connection batches.
    pub room: Option<RoomId>,
    /// Event bodies grouped by event type, in arrival order.
    pub groups: BTreeMap<String, Vec<Bytes>>,
}

impl Batch {
    /// Number of events across all groups.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }
}

/// An ephemeral room was deleted after its last member left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomClosed {
    /// The deleted room.
    pub room: RoomId,
    /// Its kind.
    pub kind: RoomKind,
}

/// Identity presence transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    /// Identity whose presence changed.
    pub identity: IdentityId,
    /// Online after the transition.
    pub online: bool,
}
