//! Queue-mediated task execution.
//!
//! ## Design
//!
//! - One queue per job kind, FIFO among waiting jobs, at-least-once delivery
//! - Workers lease a job, run the kind's handler, and acknowledge the outcome
//! - Retryability is declared by the handler's error, never inferred
//! - Terminal transitions broadcast a lifecycle event on the queue's stream
//! - Callers either fire-and-forget or await the outcome through a bridge
//!
//! ## Components
//!
//! - `JobQueue`: enqueue / lease / acknowledge (in-memory or Redis)
//! - `WorkerPool`: lease, execute, classify, acknowledge
//! - `CompletionBridge`: correlate lifecycle events with waiting callers
//! - `JobClient`: the submission API

pub mod bridge;
pub mod client;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis_queue;
pub mod types;
pub mod worker;

pub use bridge::{CompletionBridge, SubmitError};
pub use client::JobClient;
pub use queue::{InMemoryJobQueue, JobQueue, QueueError, QueueOptions, resubscribe};
#[cfg(feature = "redis")]
pub use redis_queue::RedisJobQueue;
pub use types::{
    AckOutcome, BackoffStrategy, InvalidTransition, Job, JobAttemptRecord, JobId, JobState,
    QueueStats, RetryPolicy,
};
pub use worker::{JobOutcome, PoolStats, WorkerError, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
