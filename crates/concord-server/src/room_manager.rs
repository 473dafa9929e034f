//! Room Manager
//!
//! Tracks membership of connections in logical broadcast scopes. Rooms are
//! created lazily on first join, or explicitly by a session owner. Ephemeral
//! rooms (game, tournament) are deleted when their last member leaves;
//! persistent rooms (lobby, identity, admin) survive emptiness.
//!
//! Membership changes run under the room's entry lock in a concurrent map, so
//! exactly one caller observes a room becoming empty and closes it.
//!
//! Besides local rooms the manager keeps a cluster view of rooms hosted on
//! other nodes, fed by room announcements from the propagator. The view is
//! eventually consistent. An ephemeral room that empties locally while other
//! nodes still host it is only vacated here; the node whose leave empties it
//! everywhere closes it.

use std::collections::HashSet;

use bytes::Bytes;
use concord_core::{Environment, SyncError};
use concord_proto::{ConnectionId, IdentityId, NodeId, Persistence, RoomId, RoomKind};
use dashmap::{DashMap, mapref::entry::Entry};
use serde::{Deserialize, Serialize};

/// A logical broadcast scope hosted on this node.
#[derive(Debug, Clone)]
pub struct Room<I> {
    /// Room identifier.
    pub id: RoomId,
    /// Broadcast scope kind.
    pub kind: RoomKind,
    /// Whether the room outlives its members.
    pub persistence: Persistence,
    /// Local member connections.
    pub members: HashSet<ConnectionId>,
    /// When the room was created on this node.
    pub created_at: I,
    /// Opaque application metadata.
    pub metadata: Bytes,
    /// Session owner, for explicitly created rooms.
    pub owner: Option<IdentityId>,
}

#[derive(Debug, Clone)]
struct RemoteRoom {
    kind: RoomKind,
    nodes: HashSet<NodeId>,
}

/// Outcome of [`RoomManager::join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Connection added to the room.
    Joined {
        /// Whether this join created the room.
        created: bool,
    },
    /// Connection was already a member; nothing changed.
    AlreadyMember,
}

/// Outcome of [`RoomManager::leave`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// Connection removed from the room.
    Left {
        /// Kind of the room left.
        kind: RoomKind,
        /// Whether the room was ephemeral, became empty and was deleted.
        closed: bool,
    },
    /// Connection removed; it was the last local member of an ephemeral
    /// room other nodes still host. The local entry was dropped.
    Vacated {
        /// Kind of the room left.
        kind: RoomKind,
    },
    /// Connection was not a member; nothing changed.
    NotMember,
}

/// Which rooms of a kind a kind-scoped send targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomSelector {
    /// Every room of the kind.
    All,
    /// Rooms whose id starts with the prefix.
    Prefix(String),
    /// An explicit list.
    Rooms(Vec<RoomId>),
}

impl RoomSelector {
    /// Whether `room` is selected.
    #[must_use]
    pub fn matches(&self, room: &RoomId) -> bool {
        match self {
            Self::All => true,
            Self::Prefix(prefix) => room.as_str().starts_with(prefix.as_str()),
            Self::Rooms(rooms) => rooms.contains(room),
        }
    }
}

/// Membership of connections in rooms.
pub struct RoomManager<E: Environment> {
    env: E,
    rooms: DashMap<RoomId, Room<E::Instant>>,
    remote: DashMap<RoomId, RemoteRoom>,
}

impl<E: Environment> RoomManager<E> {
    /// Create an empty room manager.
    pub fn new(env: E) -> Self {
        Self { env, rooms: DashMap::new(), remote: DashMap::new() }
    }

    fn new_room(&self, id: RoomId, kind: RoomKind, persistence: Persistence) -> Room<E::Instant> {
        Room {
            id,
            kind,
            persistence,
            members: HashSet::new(),
            created_at: self.env.now(),
            metadata: Bytes::new(),
            owner: None,
        }
    }

    /// Add `connection` to `room`, creating the room with `kind` if unknown.
    ///
    /// Joining twice is the same as joining once.
    pub fn join(&self, connection: ConnectionId, room: &RoomId, kind: RoomKind) -> JoinOutcome {
        let mut created = false;
        let mut entry = self.rooms.entry(room.clone()).or_insert_with(|| {
            created = true;
            self.new_room(room.clone(), kind, kind.default_persistence())
        });

        if !entry.members.insert(connection) {
            return JoinOutcome::AlreadyMember;
        }
        drop(entry);

        if created {
            tracing::info!(room_id = %room, kind = %kind, "room created");
        }
        tracing::debug!(room_id = %room, connection_id = %connection, "joined room");

        JoinOutcome::Joined { created }
    }

    /// Remove `connection` from `room`.
    ///
    /// # Errors
    ///
    /// - `SyncError::RoomNotFound` if the room does not exist on this node
    pub fn leave(&self, connection: ConnectionId, room: &RoomId) -> Result<LeaveOutcome, SyncError> {
        let Entry::Occupied(mut occupied) = self.rooms.entry(room.clone()) else {
            return Err(SyncError::RoomNotFound(room.clone()));
        };

        if !occupied.get_mut().members.remove(&connection) {
            return Ok(LeaveOutcome::NotMember);
        }

        tracing::debug!(room_id = %room, connection_id = %connection, "left room");

        let kind = occupied.get().kind;
        if !occupied.get().members.is_empty()
            || occupied.get().persistence == Persistence::Persistent
        {
            return Ok(LeaveOutcome::Left { kind, closed: false });
        }

        occupied.remove();
        if self.remote.contains_key(room) {
            tracing::info!(room_id = %room, kind = %kind, "room vacated, still hosted elsewhere");
            return Ok(LeaveOutcome::Vacated { kind });
        }

        tracing::info!(room_id = %room, kind = %kind, "room closed");
        Ok(LeaveOutcome::Left { kind, closed: true })
    }

    /// Create a room explicitly.
    ///
    /// `persistence` defaults to the kind's class. Returns `false` if the
    /// room already exists; an existing room is promoted to persistent when
    /// `Persistent` is requested, never demoted.
    pub fn create_room(
        &self,
        room: &RoomId,
        kind: RoomKind,
        persistence: Option<Persistence>,
        owner: Option<IdentityId>,
        metadata: Bytes,
    ) -> bool {
        let persistence = persistence.unwrap_or_else(|| kind.default_persistence());
        match self.rooms.entry(room.clone()) {
            Entry::Occupied(mut occupied) => {
                if persistence == Persistence::Persistent {
                    occupied.get_mut().persistence = Persistence::Persistent;
                }
                false
            },
            Entry::Vacant(vacant) => {
                let mut created = self.new_room(room.clone(), kind, persistence);
                created.owner = owner;
                created.metadata = metadata;
                vacant.insert(created);
                tracing::info!(room_id = %room, kind = %kind, ?persistence, "room created");
                true
            },
        }
    }

    /// Local members of `room`. Empty if the room is unknown.
    pub fn members_of(&self, room: &RoomId) -> Vec<ConnectionId> {
        self.rooms.get(room).map(|r| r.members.iter().copied().collect()).unwrap_or_default()
    }

    /// Whether `connection` is a member of `room`.
    pub fn is_member(&self, connection: ConnectionId, room: &RoomId) -> bool {
        self.rooms.get(room).is_some_and(|r| r.members.contains(&connection))
    }

    /// Whether `room` exists on this node or, as far as we know, elsewhere.
    pub fn room_exists(&self, room: &RoomId) -> bool {
        self.rooms.contains_key(room) || self.remote.contains_key(room)
    }

    /// Whether `room` exists on this node.
    pub fn is_local(&self, room: &RoomId) -> bool {
        self.rooms.contains_key(room)
    }

    /// Kind of a known room.
    pub fn room_kind(&self, room: &RoomId) -> Option<RoomKind> {
        self.rooms.get(room).map(|r| r.kind).or_else(|| self.remote.get(room).map(|r| r.kind))
    }

    /// Metadata of a local room.
    pub fn metadata(&self, room: &RoomId) -> Option<Bytes> {
        self.rooms.get(room).map(|r| r.metadata.clone())
    }

    /// Local rooms of `kind` selected by `selector`.
    pub fn rooms_matching(&self, kind: RoomKind, selector: &RoomSelector) -> Vec<RoomId> {
        self.rooms
            .iter()
            .filter(|entry| entry.kind == kind && selector.matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Record that `node` hosts `room`.
    pub fn note_remote_room(&self, room: RoomId, kind: RoomKind, node: NodeId) {
        self.remote
            .entry(room)
            .or_insert_with(|| RemoteRoom { kind, nodes: HashSet::new() })
            .nodes
            .insert(node);
    }

    /// Record that `node` no longer hosts `room`.
    ///
    /// Returns `true` when `node` was the last host anywhere, local rooms
    /// included.
    pub fn forget_remote_room(&self, room: &RoomId, node: NodeId) -> bool {
        let Entry::Occupied(mut occupied) = self.remote.entry(room.clone()) else {
            return false;
        };
        if !occupied.get_mut().nodes.remove(&node) || !occupied.get().nodes.is_empty() {
            return false;
        }
        occupied.remove();
        !self.rooms.contains_key(room)
    }

    /// Number of local rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
