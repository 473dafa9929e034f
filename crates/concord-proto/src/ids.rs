//! Identifier newtypes and the room taxonomy.
//!
//! Identifiers are opaque to the synchronization layer. Numeric ids are
//! assigned by the server (connections, nodes) or by the authorization
//! collaborator (identities); room and session ids are application strings.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transport connection identifier, unique within one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

/// Verified user identity, as returned by the authorization collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub u64);

/// Server process identifier, used to tag bus messages with their origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Logical broadcast scope identifier.
///
/// Conventional names are `game:<session>`, `lobby:<category>`,
/// `tournament:<id>`, `identity:<id>` and `admin`; the constructors below
/// produce them. Any string is accepted.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Wrap an arbitrary room name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Room announcing the transitions of a game session.
    pub fn game(session: &SessionId) -> Self {
        Self(format!("game:{}", session.as_str()))
    }

    /// Lobby room for a game category.
    pub fn lobby(category: &str) -> Self {
        Self(format!("lobby:{category}"))
    }

    /// Tournament room.
    pub fn tournament(id: &str) -> Self {
        Self(format!("tournament:{id}"))
    }

    /// Room reaching every connection of one identity.
    pub fn identity(identity: IdentityId) -> Self {
        Self(format!("identity:{}", identity.0))
    }

    /// Administrative observer room.
    pub fn admin() -> Self {
        Self("admin".to_owned())
    }

    /// Room name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoomId({})", self.0)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a piece of versioned session state (a game board, a
/// tournament bracket).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap a session name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Session name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of logical room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RoomKind {
    /// One game session.
    Game,
    /// Lobby for a game category.
    Lobby,
    /// Tournament participants and spectators.
    Tournament,
    /// Every connection of one identity.
    Identity,
    /// Administrative observers.
    Admin,
}

impl RoomKind {
    /// Persistence class a room of this kind gets when created by a join.
    #[must_use]
    pub const fn default_persistence(self) -> Persistence {
        match self {
            Self::Game | Self::Tournament => Persistence::Ephemeral,
            Self::Lobby | Self::Identity | Self::Admin => Persistence::Persistent,
        }
    }

    /// Short lowercase name, used in bus topics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Game => "game",
            Self::Lobby => "lobby",
            Self::Tournament => "tournament",
            Self::Identity => "identity",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for RoomKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a room outlives its last member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Persistence {
    /// Deleted when membership drops to zero.
    Ephemeral,
    /// Retained regardless of membership.
    Persistent,
}

/// Capability tag attached to a connection by the authorization collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Regular participant.
    Player,
    /// Read-only observer of games and tournaments.
    Spectator,
    /// Automated player.
    Bot,
    /// Operator with access to administrative rooms.
    Admin,
}

impl Role {
    /// Parse the lowercase role name used in configuration.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "player" => Some(Self::Player),
            "spectator" => Some(Self::Spectator),
            "bot" => Some(Self::Bot),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conventional_room_names() {
        let session = SessionId::new("g1");
        assert_eq!(RoomId::game(&session).as_str(), "game:g1");
        assert_eq!(RoomId::lobby("chess").as_str(), "lobby:chess");
        assert_eq!(RoomId::identity(IdentityId(42)).as_str(), "identity:42");
        assert_eq!(RoomId::admin().as_str(), "admin");
    }

    #[test]
    fn game_and_tournament_rooms_are_ephemeral() {
        assert_eq!(RoomKind::Game.default_persistence(), Persistence::Ephemeral);
        assert_eq!(RoomKind::Tournament.default_persistence(), Persistence::Ephemeral);
        assert_eq!(RoomKind::Lobby.default_persistence(), Persistence::Persistent);
        assert_eq!(RoomKind::Identity.default_persistence(), Persistence::Persistent);
        assert_eq!(RoomKind::Admin.default_persistence(), Persistence::Persistent);
    }

    #[test]
    fn role_names() {
        assert_eq!(Role::parse("bot"), Some(Role::Bot));
        assert_eq!(Role::parse("root"), None);
    }
}
