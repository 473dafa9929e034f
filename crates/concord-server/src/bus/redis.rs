//! Redis-backed bus for multi-process deployments.
//!
//! Publishing goes through a [`ConnectionManager`], which reconnects on its
//! own. Each subscription opens a dedicated pub/sub connection and
//! pattern-subscribes to `<prefix>*`. When that connection drops, the
//! forwarding task reconnects with exponential backoff and then reports
//! [`BusEvent::Resubscribed`]: Redis pub/sub does not replay what was
//! published in the meantime.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::{
    AsyncCommands, Client,
    aio::{ConnectionManager, PubSub},
};
use tokio::sync::mpsc;

use super::{Bus, BusDelivery, BusError, BusEvent, BusSubscription, SUBSCRIPTION_BUFFER};

/// First delay before resubscribing.
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound on the resubscribe delay.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

fn io(e: redis::RedisError) -> BusError {
    BusError::Io(e.to_string())
}

/// Doubling delay between reconnect attempts.
#[derive(Debug)]
struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self { next: INITIAL_BACKOFF }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(MAX_BACKOFF);
        delay
    }

    fn reset(&mut self) {
        self.next = INITIAL_BACKOFF;
    }
}

/// Bus over Redis PUBLISH / PSUBSCRIBE.
#[derive(Clone)]
pub struct RedisBus {
    client: Client,
    publisher: ConnectionManager,
}

impl RedisBus {
    /// Connect to the Redis server at `url` (e.g. `redis://127.0.0.1/`).
    ///
    /// # Errors
    ///
    /// - `BusError::Io` if the URL is invalid or the server is unreachable
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = Client::open(url).map_err(io)?;
        let publisher = ConnectionManager::new(client.clone()).await.map_err(io)?;
        Ok(Self { client, publisher })
    }
}

async fn open_pubsub(client: &Client, prefix: &str) -> Result<PubSub, BusError> {
    let mut pubsub = client.get_async_pubsub().await.map_err(io)?;
    pubsub.psubscribe(format!("{prefix}*")).await.map_err(io)?;
    Ok(pubsub)
}

/// Forward messages until the subscriber goes away, resubscribing whenever
/// the pub/sub connection ends.
async fn forward(client: Client, prefix: String, mut pubsub: PubSub, tx: mpsc::Sender<BusEvent>) {
    let mut backoff = Backoff::new();
    loop {
        let mut messages = pubsub.into_on_message();
        while let Some(msg) = messages.next().await {
            let delivery = BusDelivery {
                topic: msg.get_channel_name().to_owned(),
                payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
            };
            if tx.send(BusEvent::Message(delivery)).await.is_err() {
                return;
            }
        }
        drop(messages);
        tracing::warn!(prefix = %prefix, "redis subscription dropped, resubscribing");

        pubsub = loop {
            if tx.is_closed() {
                return;
            }
            let delay = backoff.next_delay();
            tokio::time::sleep(delay).await;
            match open_pubsub(&client, &prefix).await {
                Ok(pubsub) => break pubsub,
                Err(e) => {
                    tracing::warn!(prefix = %prefix, error = %e, ?delay, "resubscribe failed");
                },
            }
        };
        backoff.reset();

        tracing::info!(prefix = %prefix, "redis subscription restored");
        if tx.send(BusEvent::Resubscribed).await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, topic: &str, message: Bytes) -> Result<(), BusError> {
        let mut conn = self.publisher.clone();
        let _receivers: i64 = conn.publish(topic, message.as_ref()).await.map_err(io)?;
        Ok(())
    }

    async fn subscribe(&self, prefix: &str) -> Result<BusSubscription, BusError> {
        let pubsub = open_pubsub(&self.client, prefix).await?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(forward(self.client.clone(), prefix.to_owned(), pubsub, tx));
        Ok(BusSubscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let mut backoff = Backoff::new();
        let delays: Vec<_> = (0..8).map(|_| backoff.next_delay()).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[5], Duration::from_millis(3200));
        assert_eq!(delays[6], MAX_BACKOFF);
        assert_eq!(delays[7], MAX_BACKOFF);

        backoff.reset();
        assert_eq!(backoff.next_delay(), INITIAL_BACKOFF);
    }
}
