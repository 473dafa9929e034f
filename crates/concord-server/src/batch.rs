//! Pending batches of non-critical events.
//!
//! Each scope (a room, or a single connection for identity and global sends)
//! owns at most one pending batch. The first event pushed into an empty scope
//! opens a batch and hands the caller a [`BatchTicket`]; the caller schedules
//! the flush. Cancelling the ticket's token (room closed, connection gone,
//! server shutting down) discards the batch.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use concord_proto::{ConnectionId, Event, RoomId};
use dashmap::{DashMap, mapref::entry::Entry};
use tokio_util::sync::CancellationToken;

/// Target of a pending batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BatchScope {
    /// Every member of a room, minus per-event exclusions.
    Room(RoomId),
    /// One connection.
    Connection(ConnectionId),
}

/// An event waiting for its batch to flush.
#[derive(Debug, Clone)]
pub struct Pending {
    /// The event.
    pub event: Event,
    /// Connection that must not receive it.
    pub exclude: Option<ConnectionId>,
}

/// Handle to a newly opened batch.
#[derive(Debug, Clone)]
pub struct BatchTicket {
    /// Identifies this batch among successive batches of the same scope.
    pub generation: u64,
    /// Cancelled when the batch is discarded.
    pub token: CancellationToken,
}

struct PendingBatch {
    generation: u64,
    entries: Vec<Pending>,
    token: CancellationToken,
}

/// All open batches.
pub struct BatchQueues {
    pending: DashMap<BatchScope, PendingBatch>,
    root: CancellationToken,
    next_generation: AtomicU64,
}

impl BatchQueues {
    /// Create empty queues. Batch tokens are children of `root`.
    pub fn new(root: CancellationToken) -> Self {
        Self { pending: DashMap::new(), root, next_generation: AtomicU64::new(1) }
    }

    /// Append to the scope's batch. Returns a ticket if this opened the batch.
    pub fn push(&self, scope: BatchScope, pending: Pending) -> Option<BatchTicket> {
        match self.pending.entry(scope) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().entries.push(pending);
                None
            },
            Entry::Vacant(vacant) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let token = self.root.child_token();
                vacant.insert(PendingBatch {
                    generation,
                    entries: vec![pending],
                    token: token.clone(),
                });
                Some(BatchTicket { generation, token })
            },
        }
    }

    /// Remove the batch opened with `generation` and return its events.
    ///
    /// Empty if that batch was already taken or cancelled.
    pub fn take(&self, scope: &BatchScope, generation: u64) -> Vec<Pending> {
        self.pending
            .remove_if(scope, |_, batch| batch.generation == generation)
            .map(|(_, batch)| batch.entries)
            .unwrap_or_default()
    }

    /// Discard the scope's batch. Returns the number of dropped events.
    pub fn cancel(&self, scope: &BatchScope) -> usize {
        match self.pending.remove(scope) {
            Some((_, batch)) => {
                batch.token.cancel();
                batch.entries.len()
            },
            None => 0,
        }
    }

    /// Number of open batches.
    pub fn open_batches(&self) -> usize {
        self.pending.len()
    }
}

/// Group events by type, preserving arrival order within a type.
pub fn coalesce<'a>(events: impl IntoIterator<Item = &'a Event>) -> BTreeMap<String, Vec<Bytes>> {
    let mut groups: BTreeMap<String, Vec<Bytes>> = BTreeMap::new();
    for event in events {
        groups.entry(event.event_type.clone()).or_default().push(event.payload.clone());
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(event_type: &str, payload: &'static [u8]) -> Pending {
        Pending { event: Event::batched(event_type, Bytes::from_static(payload)), exclude: None }
    }

    #[test]
    fn only_first_push_opens_a_batch() {
        let queues = BatchQueues::new(CancellationToken::new());
        let scope = BatchScope::Room(RoomId::new("lobby:chess"));

        let ticket = queues.push(scope.clone(), pending("typing", b"a"));
        assert!(ticket.is_some());
        assert!(queues.push(scope.clone(), pending("typing", b"b")).is_none());

        let ticket = ticket.unwrap();
        assert_eq!(queues.take(&scope, ticket.generation).len(), 2);
        assert!(queues.take(&scope, ticket.generation).is_empty());
    }

    #[test]
    fn stale_generation_does_not_take_newer_batch() {
        let queues = BatchQueues::new(CancellationToken::new());
        let scope = BatchScope::Connection(ConnectionId(1));

        let first = queues.push(scope.clone(), pending("cursor", b"1")).unwrap();
        assert_eq!(queues.cancel(&scope), 1);
        assert!(first.token.is_cancelled());

        let second = queues.push(scope.clone(), pending("cursor", b"2")).unwrap();
        assert!(queues.take(&scope, first.generation).is_empty());
        assert_eq!(queues.take(&scope, second.generation).len(), 1);
    }

    #[test]
    fn root_cancellation_reaches_batches() {
        let root = CancellationToken::new();
        let queues = BatchQueues::new(root.clone());
        let ticket = queues.push(BatchScope::Connection(ConnectionId(1)), pending("x", b"")).unwrap();

        root.cancel();
        assert!(ticket.token.is_cancelled());
    }

    #[test]
    fn coalesce_groups_by_type() {
        let events = [
            Event::batched("typing", Bytes::from_static(b"a")),
            Event::batched("cursor", Bytes::from_static(b"c")),
            Event::batched("typing", Bytes::from_static(b"b")),
        ];
        let groups = coalesce(&events);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups["typing"], vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
    }
}
