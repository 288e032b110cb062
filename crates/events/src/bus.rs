//! Event publishing/subscription abstraction (mechanics only).
//!
//! This module provides the **event bus pattern**: a pub/sub mechanism that fans
//! lifecycle events out to every current subscriber (worker pools, completion
//! bridges, loggers).
//!
//! ## Delivery
//!
//! - **Broadcast**: every subscriber receives every published message
//! - **At-most-once per subscriber**: a subscriber that is not yet subscribed, or
//!   whose transport drops, misses the message; callers that wait on a message
//!   must bound the wait with a timeout
//! - **No persistence**: the bus distributes; job state lives in the queue
//!
//! Filtering (e.g. by job id) is the subscriber's responsibility, not the bus's.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Error returned by [`Subscription::recv_timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecvTimeoutError {
    #[error("timed out waiting for a message")]
    Timeout,
    #[error("subscription closed")]
    Disconnected,
}

/// A subscription to an event stream.
///
/// Each subscription gets a copy of all events published after it was created.
///
/// ```ignore
/// let mut subscription = bus.subscribe().await?;
///
/// while let Some(event) = subscription.recv().await {
///     process(event);
/// }
/// // `None`: the bus (or its transport) is gone.
/// ```
///
/// Subscriptions are meant for a single consumer task. Dropping the subscription
/// unregisters it on the bus's next publish.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: mpsc::UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: mpsc::UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait until the next message is available. `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Try to receive a message without waiting.
    pub fn try_recv(&mut self) -> Result<M, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Wait for up to `timeout` for a message.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(RecvTimeoutError::Disconnected),
            Err(_) => Err(RecvTimeoutError::Timeout),
        }
    }
}

/// Transport-agnostic event bus (pub/sub abstraction).
///
/// ```text
/// Job Queue (ack) ──publish──▶ EventBus ──▶ Completion Bridge
/// Worker Pool ─────publish──▶          ├─▶ Worker Pool loggers
///                                      └─▶ tests / observers
/// ```
///
/// `publish()` can fail (lock poisoning, network error). Failures are surfaced to
/// the caller, which decides whether to log, retry or give up.
///
/// `subscribe()` is async so that networked transports can finish registering the
/// subscription before returning: a message published after `subscribe()`
/// resolves is delivered to that subscription.
#[async_trait]
pub trait EventBus<M>: Send + Sync
where
    M: Send + 'static,
{
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    async fn publish(&self, message: M) -> Result<(), Self::Error>;

    async fn subscribe(&self) -> Result<Subscription<M>, Self::Error>;
}

#[async_trait]
impl<M, B> EventBus<M> for Arc<B>
where
    M: Send + 'static,
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    async fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message).await
    }

    async fn subscribe(&self) -> Result<Subscription<M>, Self::Error> {
        (**self).subscribe().await
    }
}
