//! In-process bus on a tokio broadcast channel.
//!
//! Used by the simulation harness and by several nodes sharing one process.
//! Publishing can be switched to fail on demand so tests can take the bus
//! down and watch the guard open. A subscriber that lags behind the
//! broadcast buffer loses messages and is told it was resubscribed.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use super::{Bus, BusDelivery, BusError, BusEvent, BusSubscription, SUBSCRIPTION_BUFFER};

/// Default broadcast capacity before slow subscribers start lagging.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Bus shared by clones within one process.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<BusEvent>,
    published: Arc<AtomicU64>,
    failing: Arc<AtomicBool>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LocalBus {
    /// Create a bus retaining up to `capacity` unread messages per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, published: Arc::new(AtomicU64::new(0)), failing: Arc::new(AtomicBool::new(false)) }
    }

    /// Messages accepted for delivery so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Make every publish fail with `BusError::Io` until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Tell every subscriber its subscription was interrupted and restored,
    /// as a broker reconnect would.
    pub fn interrupt_subscriptions(&self) {
        let _ = self.tx.send(BusEvent::Resubscribed);
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(&self, topic: &str, message: Bytes) -> Result<(), BusError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BusError::Io("local bus failure injection".to_owned()));
        }

        // No subscribers is not an error: nobody else is listening yet
        let _ = self.tx.send(BusEvent::Message(BusDelivery { topic: topic.to_owned(), payload: message }));
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, prefix: &str) -> Result<BusSubscription, BusError> {
        let mut source = self.tx.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let prefix = prefix.to_owned();

        tokio::spawn(async move {
            loop {
                let event = match source.recv().await {
                    Ok(BusEvent::Message(delivery)) if !delivery.topic.starts_with(&prefix) => {
                        continue;
                    },
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, prefix = %prefix, "bus subscriber lagged");
                        BusEvent::Resubscribed
                    },
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        Ok(BusSubscription::new(rx))
    }
}
