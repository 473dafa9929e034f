//! Cross-node propagator.
//!
//! Translates between local router calls and bus messages. Every locally
//! originated broadcast is queued by the router on an unbounded FIFO; a single
//! publisher task drains it through the bus guard, so one node's messages
//! leave in the order they were produced. A subscriber task receives every
//! `concord.` message, skips the ones this node published, and re-emits the
//! rest to local connections.
//!
//! # State ordering
//!
//! State messages go through the node's [`StateFeed`], shared with local
//! commits: a version is delivered only right after its predecessor, older
//! versions are duplicates, and gaps are filled from durable storage. When
//! the bus reports that the subscription was re-established, every known
//! session is re-read from storage to cover what the outage dropped.
//!
//! # Room lifecycle
//!
//! Nodes announce the ephemeral rooms they start hosting. A node whose last
//! local member leaves while other nodes still host the room announces that
//! it vacated the room; only the node that empties the room cluster-wide
//! announces its closure.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use concord_core::{BreakerConfig, BreakerState, Environment, StateRecord};
use concord_proto::{ConnectionId, Event, IdentityId, NodeId, RoomId, RoomKind};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    bus::{Bus, BusError, BusEvent, BusSubscription},
    guard::{GuardError, ResilienceGuard},
    room_manager::{RoomManager, RoomSelector},
    router::BroadcastRouter,
    state_feed::{Classified, StateFeed},
    storage::Storage,
};

/// Prefix of every topic this crate publishes on.
pub const TOPIC_PREFIX: &str = "concord.";

/// Payload of a bus message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusBody {
    /// Room-scoped event.
    Room {
        /// Target room.
        room: RoomId,
        /// The event.
        event: Event,
        /// Sender connection to skip.
        exclude: Option<ConnectionId>,
    },
    /// Event for every connection of one identity.
    Identity {
        /// Target identity.
        identity: IdentityId,
        /// The event.
        event: Event,
    },
    /// Event for selected rooms of one kind.
    Kind {
        /// Target kind.
        kind: RoomKind,
        /// Which rooms of the kind.
        selector: RoomSelector,
        /// The event.
        event: Event,
    },
    /// Event for every connection.
    Global {
        /// The event.
        event: Event,
    },
    /// Accepted state transition.
    State {
        /// The committed record.
        record: StateRecord,
    },
    /// A room now exists on the origin node.
    RoomCreated {
        /// The room.
        room: RoomId,
        /// Its kind.
        kind: RoomKind,
    },
    /// The origin node's last member left an ephemeral room that other
    /// nodes still host.
    RoomVacated {
        /// The room.
        room: RoomId,
        /// Its kind.
        kind: RoomKind,
    },
    /// The last member of an ephemeral room left, cluster-wide.
    RoomClosed {
        /// The room.
        room: RoomId,
        /// Its kind.
        kind: RoomKind,
    },
    /// An identity went online or offline on the origin node.
    Presence {
        /// The identity.
        identity: IdentityId,
        /// New presence.
        online: bool,
    },
}

impl BusBody {
    /// Topic the body is published on.
    #[must_use]
    pub fn topic(&self) -> String {
        match self {
            Self::Room { room, .. } => format!("{TOPIC_PREFIX}room.{room}"),
            Self::Identity { identity, .. } => format!("{TOPIC_PREFIX}identity.{}", identity.0),
            Self::Kind { kind, .. } => format!("{TOPIC_PREFIX}kind.{kind}"),
            Self::Global { .. } => format!("{TOPIC_PREFIX}global"),
            Self::State { record } => format!("{TOPIC_PREFIX}state.{}", record.session_id),
            Self::RoomCreated { room, .. }
            | Self::RoomVacated { room, .. }
            | Self::RoomClosed { room, .. } => {
                format!("{TOPIC_PREFIX}membership.{room}")
            },
            Self::Presence { .. } => format!("{TOPIC_PREFIX}presence"),
        }
    }
}

/// A body tagged with the node that published it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Publishing node.
    pub origin: NodeId,
    /// The message.
    pub body: BusBody,
}

impl BusMessage {
    /// CBOR encoding.
    ///
    /// # Errors
    ///
    /// - `BusError::Encode` if serialization fails
    pub fn encode(&self) -> Result<Bytes, BusError> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf).map_err(|e| BusError::Encode(e.to_string()))?;
        Ok(Bytes::from(buf))
    }

    /// Decode a CBOR message.
    ///
    /// # Errors
    ///
    /// - `BusError::Encode` if the bytes are not a valid message
    pub fn decode(bytes: &[u8]) -> Result<Self, BusError> {
        ciborium::de::from_reader(bytes).map_err(|e| BusError::Encode(e.to_string()))
    }
}

/// Propagator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropagatorStats {
    /// Messages published on the bus.
    pub published: u64,
    /// Publish attempts that failed or were refused by the guard.
    pub publish_failures: u64,
    /// Remote messages applied locally.
    pub applied: u64,
    /// Remote messages discarded (own origin, duplicate version, undecodable).
    pub discarded: u64,
    /// Version gaps recovered from durable storage.
    pub gaps: u64,
    /// Times the subscription was re-established.
    pub resubscribes: u64,
}

/// Bridges the local router and the shared bus.
pub struct Propagator<E: Environment, S: Storage> {
    node_id: NodeId,
    bus: Arc<dyn Bus>,
    guard: ResilienceGuard<E>,
    router: Arc<BroadcastRouter<E>>,
    rooms: Arc<RoomManager<E>>,
    feed: Arc<StateFeed<E, S>>,
    published: AtomicU64,
    publish_failures: AtomicU64,
    applied: AtomicU64,
    discarded: AtomicU64,
    resubscribes: AtomicU64,
}

impl<E: Environment, S: Storage> Propagator<E, S> {
    /// Create a propagator for node `node_id`.
    pub fn new(
        env: E,
        node_id: NodeId,
        bus: Arc<dyn Bus>,
        breaker: BreakerConfig,
        router: Arc<BroadcastRouter<E>>,
        rooms: Arc<RoomManager<E>>,
        feed: Arc<StateFeed<E, S>>,
    ) -> Self {
        Self {
            node_id,
            bus,
            guard: ResilienceGuard::new("bus", env, breaker),
            router,
            rooms,
            feed,
            published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            applied: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            resubscribes: AtomicU64::new(0),
        }
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Breaker state of the bus guard.
    pub fn breaker_state(&self) -> BreakerState {
        self.guard.state()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> PropagatorStats {
        PropagatorStats {
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            gaps: self.feed.gaps(),
            resubscribes: self.resubscribes.load(Ordering::Relaxed),
        }
    }

    /// Publish one body through the bus guard.
    ///
    /// # Errors
    ///
    /// - `GuardError::Unavailable` if the bus circuit is open
    /// - `GuardError::Failed` if encoding or the bus itself failed
    pub async fn publish(&self, body: BusBody) -> Result<(), GuardError<BusError>> {
        let topic = body.topic();
        let bytes = BusMessage { origin: self.node_id, body }.encode().map_err(GuardError::Failed)?;

        self.guard.call(|| self.bus.publish(&topic, bytes)).await?;
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Drain the router's outbound queue until shutdown.
    pub async fn run_publisher(
        self: Arc<Self>,
        mut outbound: mpsc::UnboundedReceiver<BusBody>,
        shutdown: CancellationToken,
    ) {
        loop {
            let body = tokio::select! {
                () = shutdown.cancelled() => break,
                body = outbound.recv() => match body {
                    Some(body) => body,
                    None => break,
                },
            };

            if let Err(e) = self.publish(body).await {
                self.publish_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(node_id = %self.node_id, error = %e, "bus publish failed");
            }
        }
        tracing::debug!(node_id = %self.node_id, "publisher stopped");
    }

    /// Apply remote messages until shutdown.
    pub async fn run_subscriber(
        self: Arc<Self>,
        mut subscription: BusSubscription,
        shutdown: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                () = shutdown.cancelled() => break,
                event = subscription.recv() => match event {
                    Some(event) => event,
                    None => {
                        tracing::error!(node_id = %self.node_id, "bus subscription closed");
                        break;
                    },
                },
            };

            let delivery = match event {
                BusEvent::Message(delivery) => delivery,
                BusEvent::Resubscribed => {
                    self.resubscribes.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(node_id = %self.node_id, "bus resubscribed, resynchronizing");
                    self.feed.resync().await;
                    continue;
                },
            };

            match BusMessage::decode(&delivery.payload) {
                Ok(message) => self.apply(message).await,
                Err(e) => {
                    self.discarded.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(topic = %delivery.topic, error = %e, "undecodable bus message");
                },
            }
        }
        tracing::debug!(node_id = %self.node_id, "subscriber stopped");
    }

    /// Re-emit one remote message to local connections.
    pub async fn apply(&self, message: BusMessage) {
        if message.origin == self.node_id {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match message.body {
            BusBody::Room { room, event, exclude } => {
                self.router.deliver_room(&room, event, exclude);
            },
            BusBody::Identity { identity, event } => self.router.deliver_identity(identity, event),
            BusBody::Kind { kind, selector, event } => {
                self.router.deliver_kind(kind, &selector, event);
            },
            BusBody::Global { event } => self.router.deliver_global(event),
            BusBody::State { record } => {
                if self.feed.accept(&record).await == Classified::Duplicate {
                    self.discarded.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            },
            BusBody::RoomCreated { room, kind } => {
                self.rooms.note_remote_room(room, kind, message.origin);
            },
            BusBody::RoomVacated { room, kind } => {
                // Every host vacated at once, so nobody announced the close
                if self.rooms.forget_remote_room(&room, message.origin) {
                    self.router.deliver_room_closed(&room, kind);
                }
            },
            BusBody::RoomClosed { room, kind } => {
                let _ = self.rooms.forget_remote_room(&room, message.origin);
                self.router.deliver_room_closed(&room, kind);
            },
            BusBody::Presence { identity, online } => {
                self.router.deliver_presence(identity, online);
            },
        }

        self.applied.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_follow_naming_scheme() {
        let event = Event::batched("typing", Bytes::new());
        let room = BusBody::Room { room: RoomId::new("game:g1"), event: event.clone(), exclude: None };
        assert_eq!(room.topic(), "concord.room.game:g1");
        assert_eq!(BusBody::Global { event }.topic(), "concord.global");
        assert_eq!(
            BusBody::RoomClosed { room: RoomId::new("game:g1"), kind: RoomKind::Game }.topic(),
            "concord.membership.game:g1"
        );
        assert_eq!(
            BusBody::RoomVacated { room: RoomId::new("game:g1"), kind: RoomKind::Game }.topic(),
            "concord.membership.game:g1"
        );
        assert_eq!(
            BusBody::Presence { identity: IdentityId(4), online: true }.topic(),
            "concord.presence"
        );
    }

    #[test]
    fn message_survives_encoding() {
        let message = BusMessage {
            origin: NodeId(7),
            body: BusBody::Kind {
                kind: RoomKind::Lobby,
                selector: RoomSelector::Prefix("lobby:".to_owned()),
                event: Event::critical("maintenance", Bytes::from_static(b"soon")),
            },
        };
        let bytes = message.encode().unwrap();
        assert_eq!(BusMessage::decode(&bytes).unwrap(), message);
        assert!(BusMessage::decode(b"\xff\x00").is_err());
    }
}
