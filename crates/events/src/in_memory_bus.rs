//! In-memory event bus for tests/dev and single-process deployments.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use crate::bus::{EventBus, Subscription};

#[derive(Debug, thiserror::Error)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    #[error("event bus lock poisoned")]
    Poisoned,
}

/// In-memory pub/sub bus.
///
/// - No IO
/// - Unbounded fan-out, one channel per subscriber
/// - Dropped subscribers are pruned on the next publish
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<M>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions seen at the last publish/subscribe.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    async fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut subs = self.subscribers.lock().map_err(|_| InMemoryBusError::Poisoned)?;

        // Drop any dead subscribers while publishing.
        let before = subs.len();
        subs.retain(|tx| tx.send(message.clone()).is_ok());
        if subs.len() < before {
            trace!(pruned = before - subs.len(), "dropped closed subscriptions");
        }

        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription<M>, Self::Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .map_err(|_| InMemoryBusError::Poisoned)?
            .push(tx);
        Ok(Subscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bus::RecvTimeoutError;

    #[tokio::test]
    async fn every_subscriber_receives_every_message() {
        let bus = InMemoryEventBus::new();
        let mut a = bus.subscribe().await.unwrap();
        let mut b = bus.subscribe().await.unwrap();

        bus.publish(1u32).await.unwrap();
        bus.publish(2u32).await.unwrap();

        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_messages() {
        let bus = InMemoryEventBus::new();
        bus.publish("early").await.unwrap();

        let mut sub = bus.subscribe().await.unwrap();
        assert!(sub.try_recv().is_err());

        bus.publish("late").await.unwrap();
        assert_eq!(sub.recv().await, Some("late"));
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = InMemoryEventBus::new();
        let sub = bus.subscribe().await.unwrap();
        let _kept = bus.subscribe().await.unwrap();
        assert_eq!(bus.subscriber_count(), 2);

        drop(sub);
        bus.publish(7u8).await.unwrap();
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn recv_timeout_reports_timeout_and_disconnect() {
        let bus = InMemoryEventBus::<u8>::new();
        let mut sub = bus.subscribe().await.unwrap();

        let err = sub.recv_timeout(Duration::from_millis(10)).await.unwrap_err();
        assert_eq!(err, RecvTimeoutError::Timeout);

        drop(bus);
        let err = sub.recv_timeout(Duration::from_millis(10)).await.unwrap_err();
        assert_eq!(err, RecvTimeoutError::Disconnected);
    }
}
