//! Connection registry: live connections and the identities behind them.
//!
//! Two concurrent maps: connection id → [`Connection`] record, and identity
//! → set of its connection ids. An identity may hold several connections at
//! once (phone and desktop); presence flips online on its first connection
//! and offline when the last one is unregistered.
//!
//! Each map operation holds only the shard lock of the key it touches. The
//! identity entry lock serializes concurrent register/unregister calls for the
//! same identity, so exactly one caller observes the first and the last
//! connection.

use std::collections::{HashMap, HashSet};

use concord_core::{Connection, ConnectionConfig, Environment, SyncError};
use concord_proto::{ConnectionId, IdentityId, Role, RoomId, RoomKind, SessionId};
use dashmap::{DashMap, mapref::entry::Entry};

/// Result of a successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    /// Newly assigned connection id.
    pub connection_id: ConnectionId,
    /// Whether the identity had no other connection (presence goes online).
    pub first_for_identity: bool,
}

/// Result of removing a connection.
#[derive(Debug, Clone)]
pub struct Unregistered<I>
where
    I: Copy + Ord + std::ops::Sub<Output = std::time::Duration>,
{
    /// Final record of the removed connection.
    pub connection: Connection<I>,
    /// Whether it was the identity's last connection (presence goes offline).
    pub last_for_identity: bool,
}

/// Tracks every live transport connection.
pub struct ConnectionRegistry<E: Environment> {
    env: E,
    config: ConnectionConfig,
    connections: DashMap<ConnectionId, Connection<E::Instant>>,
    identities: DashMap<IdentityId, HashSet<ConnectionId>>,
}

impl<E: Environment> ConnectionRegistry<E> {
    /// Create an empty registry.
    pub fn new(env: E, config: ConnectionConfig) -> Self {
        Self { env, config, connections: DashMap::new(), identities: DashMap::new() }
    }

    /// Register a connection for a verified identity.
    ///
    /// # Errors
    ///
    /// - `SyncError::IdentityUnauthenticated` if `identity` is `None`
    pub fn register(
        &self,
        identity: Option<IdentityId>,
        role: Role,
    ) -> Result<Registration, SyncError> {
        let identity = identity.ok_or(SyncError::IdentityUnauthenticated)?;
        let now = self.env.now();

        let connection_id = loop {
            let candidate = ConnectionId(self.env.random_u64());
            if candidate.0 == 0 {
                continue;
            }
            if let Entry::Vacant(vacant) = self.connections.entry(candidate) {
                vacant.insert(Connection::new(candidate, identity, role, now));
                break candidate;
            }
        };

        let first_for_identity = {
            let mut set = self.identities.entry(identity).or_default();
            set.insert(connection_id);
            set.len() == 1
        };

        tracing::debug!(
            connection_id = %connection_id,
            identity = %identity,
            first_for_identity,
            "connection registered"
        );

        Ok(Registration { connection_id, first_for_identity })
    }

    /// Remove a connection. Returns `None` if it was already removed.
    pub fn unregister(&self, connection_id: ConnectionId) -> Option<Unregistered<E::Instant>> {
        let (_, mut connection) = self.connections.remove(&connection_id)?;
        connection.close();

        let last_for_identity = match self.identities.entry(connection.identity()) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().remove(&connection_id);
                if occupied.get().is_empty() {
                    occupied.remove();
                    true
                } else {
                    false
                }
            },
            Entry::Vacant(_) => true,
        };

        tracing::debug!(
            connection_id = %connection_id,
            identity = %connection.identity(),
            last_for_identity,
            "connection unregistered"
        );

        Some(Unregistered { connection, last_for_identity })
    }

    /// Record inbound activity. Returns `false` for unknown connections.
    pub fn touch(&self, connection_id: ConnectionId) -> bool {
        let now = self.env.now();
        self.connections.get_mut(&connection_id).map(|mut conn| conn.touch(now)).is_some()
    }

    /// Every connection currently held by `identity`.
    pub fn connections_for(&self, identity: IdentityId) -> HashSet<ConnectionId> {
        self.identities.get(&identity).map(|set| set.clone()).unwrap_or_default()
    }

    /// Whether `identity` has at least one live connection.
    pub fn is_online(&self, identity: IdentityId) -> bool {
        self.identities.contains_key(&identity)
    }

    /// Identity behind a connection.
    pub fn identity_of(&self, connection_id: ConnectionId) -> Option<IdentityId> {
        self.connections.get(&connection_id).map(|conn| conn.identity())
    }

    /// Role of a connection.
    pub fn role_of(&self, connection_id: ConnectionId) -> Option<Role> {
        self.connections.get(&connection_id).map(|conn| conn.role())
    }

    /// Record that the connection belongs to `room`.
    pub fn attach_room(&self, connection_id: ConnectionId, room: RoomId, kind: RoomKind) -> bool {
        self.connections
            .get_mut(&connection_id)
            .is_some_and(|mut conn| conn.attach_room(room, kind))
    }

    /// Forget that the connection belongs to `room`.
    pub fn detach_room(&self, connection_id: ConnectionId, room: &RoomId) -> bool {
        self.connections.get_mut(&connection_id).is_some_and(|mut conn| conn.detach_room(room))
    }

    /// Rooms the connection belongs to.
    pub fn rooms_of(&self, connection_id: ConnectionId) -> Vec<(RoomId, RoomKind)> {
        self.connections
            .get(&connection_id)
            .map(|conn| conn.rooms().iter().map(|(room, kind)| (room.clone(), *kind)).collect())
            .unwrap_or_default()
    }

    /// Advance the connection's catch-up pointer for `session`.
    pub fn record_seen(&self, connection_id: ConnectionId, session: &SessionId, version: u64) {
        if let Some(mut conn) = self.connections.get_mut(&connection_id) {
            conn.record_seen(session, version);
        }
    }

    /// Catch-up pointers of one connection.
    pub fn seen_versions(&self, connection_id: ConnectionId) -> HashMap<SessionId, u64> {
        self.connections
            .get(&connection_id)
            .map(|conn| conn.seen_versions().clone())
            .unwrap_or_default()
    }

    /// Live connections whose idle timeout has elapsed.
    pub fn idle_connections(&self) -> Vec<ConnectionId> {
        let now = self.env.now();
        self.connections
            .iter()
            .filter(|entry| entry.is_idle(now, &self.config))
            .map(|entry| *entry.key())
            .collect()
    }

    /// Mark a connection evicted. Returns `false` for unknown connections.
    pub fn evict(&self, connection_id: ConnectionId) -> bool {
        self.connections.get_mut(&connection_id).map(|mut conn| conn.evict()).is_some()
    }

    /// Copy of a connection record.
    pub fn snapshot(&self, connection_id: ConnectionId) -> Option<Connection<E::Instant>> {
        self.connections.get(&connection_id).map(|conn| conn.clone())
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of identities with at least one connection.
    pub fn online_count(&self) -> usize {
        self.identities.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_env::ManualEnv;

    fn registry() -> (ManualEnv, ConnectionRegistry<ManualEnv>) {
        let env = ManualEnv::new();
        (env.clone(), ConnectionRegistry::new(env, ConnectionConfig::default()))
    }

    #[test]
    fn unauthenticated_registration_is_rejected() {
        let (_, registry) = registry();
        assert_eq!(registry.register(None, Role::Player), Err(SyncError::IdentityUnauthenticated));
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn multiple_connections_per_identity() {
        let (_, registry) = registry();
        let phone = registry.register(Some(IdentityId(7)), Role::Player).unwrap();
        let desktop = registry.register(Some(IdentityId(7)), Role::Player).unwrap();

        assert!(phone.first_for_identity);
        assert!(!desktop.first_for_identity);
        assert_eq!(
            registry.connections_for(IdentityId(7)),
            HashSet::from([phone.connection_id, desktop.connection_id])
        );

        let first = registry.unregister(phone.connection_id).unwrap();
        assert!(!first.last_for_identity);
        assert!(registry.is_online(IdentityId(7)));

        let second = registry.unregister(desktop.connection_id).unwrap();
        assert!(second.last_for_identity);
        assert!(!registry.is_online(IdentityId(7)));
    }

    #[test]
    fn unregister_is_idempotent() {
        let (_, registry) = registry();
        let reg = registry.register(Some(IdentityId(1)), Role::Player).unwrap();

        assert!(registry.unregister(reg.connection_id).is_some());
        assert!(registry.unregister(reg.connection_id).is_none());
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn colliding_and_zero_ids_are_redrawn() {
        let (env, registry) = registry();
        env.set_next_random(0);
        let a = registry.register(Some(IdentityId(1)), Role::Player).unwrap();
        assert_ne!(a.connection_id.0, 0);

        env.set_next_random(a.connection_id.0);
        let b = registry.register(Some(IdentityId(2)), Role::Player).unwrap();
        assert_ne!(a.connection_id, b.connection_id);
    }

    #[test]
    fn idle_connections_reported_after_timeout() {
        let (env, registry) = registry();
        let quiet = registry.register(Some(IdentityId(1)), Role::Player).unwrap();
        let busy = registry.register(Some(IdentityId(2)), Role::Player).unwrap();

        env.advance(Duration::from_secs(45));
        registry.touch(busy.connection_id);
        env.advance(Duration::from_secs(20));

        assert_eq!(registry.idle_connections(), vec![quiet.connection_id]);
        registry.evict(quiet.connection_id);
        assert!(registry.idle_connections().is_empty());
    }

    #[test]
    fn room_bookkeeping_follows_connection() {
        let (_, registry) = registry();
        let reg = registry.register(Some(IdentityId(1)), Role::Player).unwrap();
        let room = RoomId::new("game:g1");

        assert!(registry.attach_room(reg.connection_id, room.clone(), RoomKind::Game));
        registry.record_seen(reg.connection_id, &SessionId::new("g1"), 4);

        let removed = registry.unregister(reg.connection_id).unwrap();
        assert_eq!(removed.connection.rooms().get(&room), Some(&RoomKind::Game));
        assert_eq!(removed.connection.seen_versions()[&SessionId::new("g1")], 4);
    }
}
