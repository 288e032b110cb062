//! `offload-core`: shared vocabulary for the job system.
//!
//! Identifiers, job kinds and the failure taxonomy used by handlers, queues
//! and callers. No IO lives here.

pub mod error;
pub mod id;
pub mod kind;

pub use error::{CoreError, FailureKind, FailureReason, TaskError};
pub use id::JobId;
pub use kind::JobKind;
