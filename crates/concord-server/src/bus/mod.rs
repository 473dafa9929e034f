//! Shared publish/subscribe bus between cooperating server processes.
//!
//! The bus is topic based: publishers send opaque bytes on a topic, and
//! subscribers receive every message whose topic starts with their prefix.
//! Delivery is at-least-once and FIFO per publisher within a topic; the
//! propagator makes application idempotent.
//!
//! A subscription survives broker outages: the bus re-establishes it and
//! reports [`BusEvent::Resubscribed`], since anything published in between
//! may be lost.

mod local;
mod redis;

use async_trait::async_trait;
use bytes::Bytes;
pub use local::LocalBus;
use thiserror::Error;
use tokio::sync::mpsc;

pub use self::redis::RedisBus;
use crate::guard::DependencyFailure;

/// Errors from bus operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The bus shut down.
    #[error("bus closed")]
    Closed,

    /// The broker connection failed.
    #[error("bus I/O error: {0}")]
    Io(String),

    /// A message could not be encoded or decoded.
    #[error("bus message encoding error: {0}")]
    Encode(String),
}

impl DependencyFailure for BusError {
    fn is_dependency_failure(&self) -> bool {
        matches!(self, Self::Closed | Self::Io(_))
    }
}

/// One message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusDelivery {
    /// Topic it was published on.
    pub topic: String,
    /// Opaque message bytes.
    pub payload: Bytes,
}

/// What a subscription yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// A message matching the prefix.
    Message(BusDelivery),
    /// The subscription was interrupted and re-established. Messages
    /// published during the interruption may be missing.
    Resubscribed,
}

/// Stream of events for a subscription prefix.
pub struct BusSubscription {
    rx: mpsc::Receiver<BusEvent>,
}

impl BusSubscription {
    /// Wrap the receiving end of a forwarding channel.
    pub fn new(rx: mpsc::Receiver<BusEvent>) -> Self {
        Self { rx }
    }

    /// Next event. `None` once the bus side has gone away for good.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.rx.recv().await
    }
}

/// Capacity of a subscription's forwarding channel.
pub const SUBSCRIPTION_BUFFER: usize = 1024;

/// Publish/subscribe transport between nodes.
#[async_trait]
pub trait Bus: Send + Sync + 'static {
    /// Publish `message` on `topic`.
    ///
    /// # Errors
    ///
    /// - `BusError::Closed` if the bus shut down
    /// - `BusError::Io` if the broker could not be reached
    async fn publish(&self, topic: &str, message: Bytes) -> Result<(), BusError>;

    /// Receive every message whose topic starts with `prefix`.
    ///
    /// # Errors
    ///
    /// - `BusError::Io` if the subscription could not be established
    async fn subscribe(&self, prefix: &str) -> Result<BusSubscription, BusError>;
}
