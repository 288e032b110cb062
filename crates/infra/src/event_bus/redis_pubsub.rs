//! Redis pub/sub-backed lifecycle bus (optional).
//!
//! Pub/sub is not durable: a subscriber that is offline when an event is
//! published misses it. Job state itself lives in the queue, so waiters can
//! always fall back to reading it.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::{OnceCell, mpsc};
use tokio_stream::StreamExt;
use tracing::{debug, instrument, warn};

use offload_events::{EventBus, LifecycleEvent, Subscription};

#[derive(Debug, thiserror::Error)]
pub enum RedisBusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Redis pub/sub bus for one channel of lifecycle events.
#[derive(Debug)]
pub struct RedisLifecycleBus {
    client: redis::Client,
    channel: String,
    conn: OnceCell<MultiplexedConnection>,
}

impl RedisLifecycleBus {
    pub fn new(client: redis::Client, channel: impl Into<String>) -> Self {
        Self {
            client,
            channel: channel.into(),
            conn: OnceCell::new(),
        }
    }

    pub fn open(redis_url: impl AsRef<str>, channel: impl Into<String>) -> Result<Self, RedisBusError> {
        Ok(Self::new(redis::Client::open(redis_url.as_ref())?, channel))
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    async fn connection(&self) -> Result<MultiplexedConnection, RedisBusError> {
        let conn = self
            .conn
            .get_or_try_init(|| self.client.get_multiplexed_async_connection())
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl EventBus<LifecycleEvent> for RedisLifecycleBus {
    type Error = RedisBusError;

    #[instrument(skip(self, message), fields(channel = %self.channel, event = message.label()), err)]
    async fn publish(&self, message: LifecycleEvent) -> Result<(), Self::Error> {
        let payload = serde_json::to_string(&message)?;
        let mut conn = self.connection().await?;

        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        debug!(receivers, "lifecycle event published");

        Ok(())
    }

    #[instrument(skip(self), fields(channel = %self.channel), err)]
    async fn subscribe(&self) -> Result<Subscription<LifecycleEvent>, Self::Error> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let channel = self.channel.clone();

        // Forward messages until the subscriber goes away or the connection drops.
        tokio::spawn(async move {
            let messages = pubsub.into_on_message();
            tokio::pin!(messages);

            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "unreadable pub/sub payload");
                        continue;
                    }
                };

                let event: LifecycleEvent = match serde_json::from_str(&payload) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "malformed lifecycle event");
                        continue;
                    }
                };

                if tx.send(event).is_err() {
                    return;
                }
            }
            debug!(channel = %channel, "pub/sub stream ended");
        });

        Ok(Subscription::new(rx))
    }
}
