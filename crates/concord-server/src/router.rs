//! Broadcast router: fans events out to local connections.
//!
//! Critical events (state transitions, room closures, presence, anything the
//! sender marks critical) are delivered immediately. Everything else is
//! queued per target scope and coalesced into one `Batch` envelope per flush
//! window, grouped by event type.
//!
//! Every `send_*` call is locally originated: it delivers to this node's
//! connections and hands the same message, in call order, to the
//! propagator's outbound queue. The `deliver_*` variants only deliver
//! locally; the propagator uses them for messages from other nodes.
//!
//! Outbound queues are bounded. A full queue drops the envelope with a
//! warning; the client recovers through version checks and catch-up.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use concord_core::{Environment, StateRecord};
use concord_proto::{
    ConnectionId, Event, IdentityId, Payload, RoomId, RoomKind,
    payloads::room::{Batch, Deliver, Presence, RoomClosed},
};
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::{
    batch::{BatchQueues, BatchScope, BatchTicket, Pending, coalesce},
    propagator::BusBody,
    registry::ConnectionRegistry,
    room_manager::{RoomManager, RoomSelector},
};

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Envelopes placed on an outbound queue.
    pub delivered: u64,
    /// Envelopes dropped because an outbound queue was full.
    pub dropped: u64,
    /// Batches flushed.
    pub batches_flushed: u64,
}

/// Local fan-out with per-scope batching.
pub struct BroadcastRouter<E: Environment> {
    env: E,
    registry: Arc<ConnectionRegistry<E>>,
    rooms: Arc<RoomManager<E>>,
    sinks: DashMap<ConnectionId, mpsc::Sender<Payload>>,
    batches: BatchQueues,
    window: Duration,
    outbound: Option<mpsc::UnboundedSender<BusBody>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
    batches_flushed: AtomicU64,
}

impl<E: Environment> BroadcastRouter<E> {
    /// Create a router.
    ///
    /// Batch flush tasks are cancelled with `shutdown`. With `outbound` set,
    /// every locally originated send is also queued for the bus.
    pub fn new(
        env: E,
        registry: Arc<ConnectionRegistry<E>>,
        rooms: Arc<RoomManager<E>>,
        window: Duration,
        shutdown: CancellationToken,
        outbound: Option<mpsc::UnboundedSender<BusBody>>,
    ) -> Self {
        Self {
            env,
            registry,
            rooms,
            sinks: DashMap::new(),
            batches: BatchQueues::new(shutdown),
            window,
            outbound,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
        }
    }

    /// Route envelopes for `connection` into `sink`.
    pub fn attach(&self, connection: ConnectionId, sink: mpsc::Sender<Payload>) {
        self.sinks.insert(connection, sink);
    }

    /// Stop delivering to `connection` and discard its pending batch.
    pub fn detach(&self, connection: ConnectionId) {
        self.sinks.remove(&connection);
        let dropped = self.batches.cancel(&BatchScope::Connection(connection));
        if dropped > 0 {
            tracing::debug!(connection_id = %connection, dropped, "discarded connection batch");
        }
    }

    /// Snapshot of the delivery counters.
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
        }
    }

    /// Number of batches waiting for their window to close.
    pub fn open_batches(&self) -> usize {
        self.batches.open_batches()
    }

    /// Put `payload` on one connection's outbound queue.
    ///
    /// Returns `false` if the connection is unknown, gone, or its queue is full.
    pub fn send_direct(&self, connection: ConnectionId, payload: Payload) -> bool {
        let Some(sink) = self.sinks.get(&connection) else {
            return false;
        };

        match sink.try_send(payload) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                true
            },
            Err(TrySendError::Full(payload)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    connection_id = %connection,
                    opcode = ?payload.opcode(),
                    "outbound queue full, dropping envelope"
                );
                false
            },
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(connection_id = %connection, "outbound queue closed");
                false
            },
        }
    }

    fn publish(&self, body: BusBody) {
        if let Some(outbound) = &self.outbound {
            if outbound.send(body).is_err() {
                tracing::debug!("propagator stopped, message stays local");
            }
        }
    }

    /// Send `event` to every member of `room`, except `exclude`.
    pub fn send_to_room(self: &Arc<Self>, room: &RoomId, event: Event, exclude: Option<ConnectionId>) {
        self.publish(BusBody::Room { room: room.clone(), event: event.clone(), exclude });
        self.deliver_room(room, event, exclude);
    }

    /// Send `event` to every connection of `identity`.
    pub fn send_to_identity(self: &Arc<Self>, identity: IdentityId, event: Event) {
        self.publish(BusBody::Identity { identity, event: event.clone() });
        self.deliver_identity(identity, event);
    }

    /// Send `event` to the rooms of `kind` picked by `selector`.
    pub fn send_to_kind(self: &Arc<Self>, kind: RoomKind, selector: RoomSelector, event: Event) {
        self.publish(BusBody::Kind { kind, selector: selector.clone(), event: event.clone() });
        self.deliver_kind(kind, &selector, event);
    }

    /// Send `event` to every connection.
    pub fn send_global(self: &Arc<Self>, event: Event) {
        self.publish(BusBody::Global { event: event.clone() });
        self.deliver_global(event);
    }

    /// Hand an accepted state transition to the bus. Local delivery goes
    /// through the node's state feed, which orders it against remote
    /// versions.
    pub fn announce_state(&self, record: &StateRecord) {
        self.publish(BusBody::State { record: record.clone() });
    }

    /// Announce that `identity` went online or offline.
    pub fn send_presence(&self, identity: IdentityId, online: bool) {
        self.publish(BusBody::Presence { identity, online });
        self.deliver_presence(identity, online);
    }

    /// Announce a room that now exists on this node.
    pub fn announce_room_created(&self, room: &RoomId, kind: RoomKind) {
        self.publish(BusBody::RoomCreated { room: room.clone(), kind });
    }

    /// Tell other nodes this node no longer hosts `room`, and discard the
    /// room's batch.
    pub fn room_vacated(&self, room: &RoomId, kind: RoomKind) {
        self.batches.cancel(&BatchScope::Room(room.clone()));
        self.publish(BusBody::RoomVacated { room: room.clone(), kind });
    }

    /// Discard the room's batch and announce its closure.
    pub fn room_closed(&self, room: &RoomId, kind: RoomKind) {
        self.publish(BusBody::RoomClosed { room: room.clone(), kind });
        self.deliver_room_closed(room, kind);
    }

    /// Local half of [`Self::send_to_room`].
    pub fn deliver_room(self: &Arc<Self>, room: &RoomId, event: Event, exclude: Option<ConnectionId>) {
        if event.critical {
            let deliver = Payload::Deliver(Deliver { room: Some(room.clone()), event });
            for member in self.rooms.members_of(room) {
                if Some(member) != exclude {
                    self.send_direct(member, deliver.clone());
                }
            }
        } else {
            self.enqueue(BatchScope::Room(room.clone()), Pending { event, exclude });
        }
    }

    /// Local half of [`Self::send_to_identity`].
    pub fn deliver_identity(self: &Arc<Self>, identity: IdentityId, event: Event) {
        for connection in self.registry.connections_for(identity) {
            self.deliver_connection(connection, event.clone());
        }
    }

    /// Local half of [`Self::send_to_kind`].
    pub fn deliver_kind(self: &Arc<Self>, kind: RoomKind, selector: &RoomSelector, event: Event) {
        for room in self.rooms.rooms_matching(kind, selector) {
            self.deliver_room(&room, event.clone(), None);
        }
    }

    /// Local half of [`Self::send_global`].
    pub fn deliver_global(self: &Arc<Self>, event: Event) {
        let connections: Vec<ConnectionId> = self.sinks.iter().map(|entry| *entry.key()).collect();
        for connection in connections {
            self.deliver_connection(connection, event.clone());
        }
    }

    /// Deliver a state transition to the members of its room. Advances each
    /// receiver's catch-up pointer.
    pub fn deliver_state(&self, record: &StateRecord) {
        let changed = Payload::StateChanged(record.to_snapshot());
        for member in self.rooms.members_of(&record.room) {
            if self.send_direct(member, changed.clone()) {
                self.registry.record_seen(member, &record.session_id, record.version);
            }
        }
    }

    /// Local half of [`Self::send_presence`].
    pub fn deliver_presence(&self, identity: IdentityId, online: bool) {
        let presence = Payload::Presence(Presence { identity, online });
        let connections: Vec<ConnectionId> = self.sinks.iter().map(|entry| *entry.key()).collect();
        for connection in connections {
            self.send_direct(connection, presence.clone());
        }
    }

    /// Local half of [`Self::room_closed`]: administrative observers hear
    /// about it, since the room itself has no members left.
    pub fn deliver_room_closed(&self, room: &RoomId, kind: RoomKind) {
        self.batches.cancel(&BatchScope::Room(room.clone()));

        let closed = Payload::RoomClosed(RoomClosed { room: room.clone(), kind });
        for observer in self.rooms.members_of(&RoomId::admin()) {
            self.send_direct(observer, closed.clone());
        }
    }

    fn deliver_connection(self: &Arc<Self>, connection: ConnectionId, event: Event) {
        if event.critical {
            self.send_direct(connection, Payload::Deliver(Deliver { room: None, event }));
        } else {
            self.enqueue(BatchScope::Connection(connection), Pending { event, exclude: None });
        }
    }

    fn enqueue(self: &Arc<Self>, scope: BatchScope, pending: Pending) {
        if let Some(ticket) = self.batches.push(scope.clone(), pending) {
            self.schedule_flush(scope, ticket);
        }
    }

    fn schedule_flush(self: &Arc<Self>, scope: BatchScope, ticket: BatchTicket) {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = ticket.token.cancelled() => {},
                () = router.env.sleep(router.window) => router.flush(&scope, ticket.generation),
            }
        });
    }

    fn flush(&self, scope: &BatchScope, generation: u64) {
        let entries = self.batches.take(scope, generation);
        if entries.is_empty() {
            return;
        }
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);

        match scope {
            BatchScope::Room(room) => {
                for member in self.rooms.members_of(room) {
                    let groups = coalesce(
                        entries.iter().filter(|p| p.exclude != Some(member)).map(|p| &p.event),
                    );
                    if !groups.is_empty() {
                        let batch = Batch { room: Some(room.clone()), groups };
                        self.send_direct(member, Payload::Batch(batch));
                    }
                }
            },
            BatchScope::Connection(connection) => {
                let groups = coalesce(entries.iter().map(|p| &p.event));
                self.send_direct(*connection, Payload::Batch(Batch { room: None, groups }));
            },
        }

        tracing::trace!(?scope, events = entries.len(), "batch flushed");
    }
}
