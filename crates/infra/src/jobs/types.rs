//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use offload_core::{FailureReason, JobKind, TaskError};

pub use offload_core::JobId;

/// Job lifecycle state.
///
/// ```text
/// Waiting ──lease──▶ Active ──ack complete──▶ Completed
///    ▲                 │
///    └──retry (tail)───┤
///                      └──ack failed──▶ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, waiting to be leased
    Waiting,
    /// Leased by a worker
    Active,
    /// Completed successfully
    Completed,
    /// Failed terminally
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// A state transition was requested on a job that is not `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("job {id} is {state:?}, expected active")]
pub struct InvalidTransition {
    pub id: JobId,
    pub state: JobState,
}

/// How the retry delay grows with the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base`
    #[default]
    Fixed,
    /// `base * 2^(attempt - 1)`
    Exponential,
    /// `base * attempt`
    Linear,
}

/// Retry budget and backoff for one queue.
///
/// `max_attempts` counts executions, not retries: 3 means one try plus two
/// retries. The default delay is zero, so a retried job goes straight to the
/// tail of the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound for any computed delay
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Fixed,
        }
    }
}

impl RetryPolicy {
    /// One execution, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Delay before a job whose `attempt`-th execution failed is ready again.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// A queued job.
///
/// Only the owning queue calls the transition methods; workers request
/// transitions through the queue's acknowledge operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    /// Job kind for routing
    pub kind: JobKind,
    /// JSON payload
    pub payload: JsonValue,
    /// Current state
    pub state: JobState,
    /// Executions started so far
    pub attempts: u32,
    /// Execution budget
    pub max_attempts: u32,
    /// Set once on completion
    pub result: Option<JsonValue>,
    /// Set once on terminal failure
    pub failure: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time a waiting job may be leased (retry backoff)
    pub available_at: Option<DateTime<Utc>>,
    /// Deadline of the current lease; past it the job is redelivered
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Execution history
    pub history: Vec<JobAttemptRecord>,
}

impl Job {
    /// Create a new waiting job.
    pub fn new(kind: JobKind, payload: JsonValue, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            kind,
            payload,
            state: JobState::Waiting,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            result: None,
            failure: None,
            created_at: now,
            updated_at: now,
            available_at: None,
            lease_expires_at: None,
            history: Vec::new(),
        }
    }

    /// Check if a waiting job may be leased at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Waiting && self.available_at.is_none_or(|at| now >= at)
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Active && self.lease_expires_at.is_some_and(|at| now >= at)
    }

    /// Waiting → Active; starts a new attempt.
    pub fn mark_active(&mut self, lease_timeout: Duration) -> Result<(), InvalidTransition> {
        self.mark_active_until(lease_deadline(Utc::now(), lease_timeout))
    }

    /// Waiting → Active with an explicit lease deadline.
    pub fn mark_active_until(&mut self, deadline: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if self.state != JobState::Waiting {
            return Err(self.invalid());
        }
        self.state = JobState::Active;
        self.attempts += 1;
        self.available_at = None;
        self.lease_expires_at = Some(deadline);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Active → Completed.
    pub fn mark_completed(&mut self, result: JsonValue) -> Result<(), InvalidTransition> {
        self.ensure_active()?;
        self.record_attempt(None);
        self.state = JobState::Completed;
        self.result = Some(result);
        self.lease_expires_at = None;
        Ok(())
    }

    /// Active → Waiting, eligible again after `delay`.
    pub fn mark_requeued(&mut self, error: &TaskError, delay: Duration) -> Result<(), InvalidTransition> {
        self.ensure_active()?;
        self.record_attempt(Some(error.to_string()));
        self.state = JobState::Waiting;
        self.lease_expires_at = None;
        self.available_at = (!delay.is_zero()).then(|| saturating_add(self.updated_at, delay));
        Ok(())
    }

    /// Active → Failed.
    pub fn mark_failed(&mut self, error: TaskError) -> Result<FailureReason, InvalidTransition> {
        self.ensure_active()?;
        self.record_attempt(Some(error.to_string()));
        let failure = error.into_failure(self.attempts);
        self.state = JobState::Failed;
        self.failure = Some(failure.clone());
        self.lease_expires_at = None;
        Ok(failure)
    }

    fn ensure_active(&self) -> Result<(), InvalidTransition> {
        if self.state != JobState::Active {
            return Err(self.invalid());
        }
        Ok(())
    }

    fn invalid(&self) -> InvalidTransition {
        InvalidTransition {
            id: self.id,
            state: self.state,
        }
    }

    fn record_attempt(&mut self, error: Option<String>) {
        let now = Utc::now();
        let started_at = self.updated_at;
        self.history.push(JobAttemptRecord {
            attempt: self.attempts,
            started_at,
            finished_at: now,
            success: error.is_none(),
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
        self.updated_at = now;
    }
}

/// Deadline of a lease taken at `now`.
pub fn lease_deadline(now: DateTime<Utc>, lease_timeout: Duration) -> DateTime<Utc> {
    saturating_add(now, lease_timeout)
}

/// `at + d`, clamped to the latest representable instant.
pub(crate) fn saturating_add(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - d`, clamped to the earliest representable instant.
pub(crate) fn saturating_sub(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Outcome of `acknowledge_failed`.
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    /// Back in the queue at the tail.
    Requeued { available_at: Option<DateTime<Utc>> },
    /// Terminally failed; a `failed` event was emitted.
    Failed(FailureReason),
}

/// Per-queue job counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Waiting jobs, including ones delayed by backoff
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueStats {
    /// No waiting and no active jobs.
    pub fn is_drained(&self) -> bool {
        self.waiting == 0 && self.active == 0
    }
}
