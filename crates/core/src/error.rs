//! Failure taxonomy.
//!
//! Handlers report a [`TaskError`] whose [`FailureKind`] is *declared* by the
//! handler, never inferred from message text. The worker pool turns the last
//! error into a [`FailureReason`], which is the only failure shape that crosses
//! the queue boundary back to callers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Parse/lookup errors for core vocabulary types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A job kind name did not match any known kind.
    #[error("unknown job kind: {0}")]
    UnknownJobKind(String),
}

/// Classification of a failed attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Missing or malformed payload. Never retried.
    Validation,
    /// Network/timeout-class failure. Retried up to the job's attempt budget.
    Transient,
    /// Handler-classified terminal failure (authorization, not-found, ...).
    Permanent,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::Transient)
    }
}

impl core::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            FailureKind::Validation => "validation",
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
        };
        f.write_str(s)
    }
}

/// Error returned by a task handler.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} failure: {message}")]
pub struct TaskError {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, msg)
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, msg)
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, msg)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Freeze this error as the terminal reason of a job.
    pub fn into_failure(self, attempts: u32) -> FailureReason {
        FailureReason {
            kind: self.kind,
            message: self.message,
            attempts,
        }
    }
}

/// Terminal failure recorded on a job and broadcast with its `failed` event.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} failure after {attempts} attempt(s): {message}")]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
    /// Attempts consumed when the job failed.
    pub attempts: u32,
}
