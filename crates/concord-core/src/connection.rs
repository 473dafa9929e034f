//! Per-connection record and lifecycle.
//!
//! A `Connection` is owned by the connection registry. It is a pure data
//! structure: timestamps are passed in, nothing here performs I/O.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐  idle timeout   ┌─────────┐
//! │ Live │────────────────>│ Evicted │
//! └──────┘                 └─────────┘
//!     │                         │
//!     │ transport close         │ unregister
//!     ↓                         ↓
//! ┌────────┐               ┌────────┐
//! │ Closed │               │ Closed │
//! └────────┘               └────────┘
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    ops::Sub,
    time::Duration,
};

use concord_proto::{ConnectionId, IdentityId, Role, RoomId, RoomKind, SessionId};

/// Maximum time allowed without any activity before the connection is evicted.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval at which clients are expected to ping while otherwise idle.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered and receiving deliveries
    Live,
    /// Idle timeout elapsed; waiting for the driver to tear it down
    Evicted,
    /// Transport closed
    Closed,
}

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Idle timeout before eviction
    pub idle_timeout: Duration,
    /// Heartbeat interval advertised to clients (should be < idle_timeout / 2)
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self { idle_timeout: DEFAULT_IDLE_TIMEOUT, heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL }
    }
}

/// One live transport connection and the identity behind it.
///
/// Generic over `Instant` to support both real time and virtual time for
/// deterministic testing.
#[derive(Debug, Clone)]
pub struct Connection<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    id: ConnectionId,
    identity: IdentityId,
    role: Role,
    state: ConnectionState,
    created_at: I,
    last_activity: I,
    rooms: BTreeMap<RoomId, RoomKind>,
    seen_versions: HashMap<SessionId, u64>,
}

impl<I> Connection<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Create a live connection.
    pub fn new(id: ConnectionId, identity: IdentityId, role: Role, now: I) -> Self {
        Self {
            id,
            identity,
            role,
            state: ConnectionState::Live,
            created_at: now,
            last_activity: now,
            rooms: BTreeMap::new(),
            seen_versions: HashMap::new(),
        }
    }

    /// Connection identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Owning identity.
    #[must_use]
    pub fn identity(&self) -> IdentityId {
        self.identity
    }

    /// Capability tag.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Liveness flag.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.state == ConnectionState::Live
    }

    /// Registration time.
    #[must_use]
    pub fn created_at(&self) -> I {
        self.created_at
    }

    /// Time of the last inbound activity.
    #[must_use]
    pub fn last_activity(&self) -> I {
        self.last_activity
    }

    /// Record inbound activity.
    pub fn touch(&mut self, now: I) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    /// Whether the idle timeout has elapsed at `now`.
    #[must_use]
    pub fn is_idle(&self, now: I, config: &ConnectionConfig) -> bool {
        self.is_alive() && now - self.last_activity > config.idle_timeout
    }

    /// Rooms this connection belongs to, with their kinds.
    #[must_use]
    pub fn rooms(&self) -> &BTreeMap<RoomId, RoomKind> {
        &self.rooms
    }

    /// Record room membership. Returns `false` if already recorded.
    pub fn attach_room(&mut self, room: RoomId, kind: RoomKind) -> bool {
        self.rooms.insert(room, kind).is_none()
    }

    /// Forget room membership. Returns `false` if not recorded.
    pub fn detach_room(&mut self, room: &RoomId) -> bool {
        self.rooms.remove(room).is_some()
    }

    /// Record that `version` of `session` was delivered. Never moves a
    /// pointer backwards.
    pub fn record_seen(&mut self, session: &SessionId, version: u64) {
        match self.seen_versions.get_mut(session) {
            Some(seen) => *seen = (*seen).max(version),
            None => {
                self.seen_versions.insert(session.clone(), version);
            },
        }
    }

    /// Last delivered version per session.
    #[must_use]
    pub fn seen_versions(&self) -> &HashMap<SessionId, u64> {
        &self.seen_versions
    }

    /// Mark the connection evicted (idle timeout or operator action).
    pub fn evict(&mut self) {
        if self.state == ConnectionState::Live {
            self.state = ConnectionState::Evicted;
        }
    }

    /// Mark the connection closed.
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn connection(now: Instant) -> Connection<Instant> {
        Connection::new(ConnectionId(1), IdentityId(10), Role::Player, now)
    }

    #[test]
    fn idle_after_timeout() {
        let t0 = Instant::now();
        let config = ConnectionConfig::default();
        let mut conn = connection(t0);

        assert!(!conn.is_idle(t0 + Duration::from_secs(59), &config));
        assert!(conn.is_idle(t0 + Duration::from_secs(61), &config));

        conn.touch(t0 + Duration::from_secs(30));
        assert!(!conn.is_idle(t0 + Duration::from_secs(61), &config));
    }

    #[test]
    fn evicted_connection_is_not_idle_again() {
        let t0 = Instant::now();
        let config = ConnectionConfig::default();
        let mut conn = connection(t0);

        conn.evict();
        assert!(!conn.is_alive());
        assert!(!conn.is_idle(t0 + Duration::from_secs(120), &config));
    }

    #[test]
    fn seen_versions_never_regress() {
        let mut conn = connection(Instant::now());
        let session = SessionId::new("g1");

        conn.record_seen(&session, 5);
        conn.record_seen(&session, 3);
        assert_eq!(conn.seen_versions()[&session], 5);
        conn.record_seen(&session, 6);
        assert_eq!(conn.seen_versions()[&session], 6);
    }

    #[test]
    fn room_membership_is_a_set() {
        let mut conn = connection(Instant::now());
        let room = RoomId::new("game:g1");

        assert!(conn.attach_room(room.clone(), RoomKind::Game));
        assert!(!conn.attach_room(room.clone(), RoomKind::Game));
        assert!(conn.detach_room(&room));
        assert!(!conn.detach_room(&room));
    }
}
