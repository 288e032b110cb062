//! Infrastructure layer: queues, workers, completion bridge, broker adapters, config.

pub mod config;
pub mod event_bus;
pub mod jobs;
pub mod runtime;

mod integration_tests;

pub use config::{ConfigError, OffloadConfig, QueueSettings};
pub use jobs::{CompletionBridge, JobClient, JobQueue, SubmitError};
pub use runtime::{JobSystem, SystemError};
