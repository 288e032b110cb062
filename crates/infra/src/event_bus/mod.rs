//! Infrastructure event bus implementations.
//!
//! The bus abstraction and the in-memory bus live in `offload-events`. This
//! module provides broker-backed implementations.

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::{RedisBusError, RedisLifecycleBus};
