//! Job lifecycle events broadcast per queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use offload_core::{FailureReason, JobId, JobKind};

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEventKind {
    /// A worker began an attempt.
    Started { attempt: u32 },
    /// The job finished successfully. Terminal.
    Completed { result: JsonValue },
    /// The job failed and will not be retried. Terminal.
    Failed { failure: FailureReason },
    /// The queue has no waiting and no active jobs.
    Drained,
    /// A worker-level error (e.g. the broker could not be reached).
    Error { message: String },
}

/// Fire-once notification of a job (or queue) state change.
///
/// `job_id` is absent for queue-wide events (`drained`, most `error`s).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    job_id: Option<JobId>,
    kind: JobKind,
    event: LifecycleEventKind,
    emitted_at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(job_id: Option<JobId>, kind: JobKind, event: LifecycleEventKind) -> Self {
        Self {
            job_id,
            kind,
            event,
            emitted_at: Utc::now(),
        }
    }

    pub fn started(job_id: JobId, kind: JobKind, attempt: u32) -> Self {
        Self::new(Some(job_id), kind, LifecycleEventKind::Started { attempt })
    }

    pub fn completed(job_id: JobId, kind: JobKind, result: JsonValue) -> Self {
        Self::new(Some(job_id), kind, LifecycleEventKind::Completed { result })
    }

    pub fn failed(job_id: JobId, kind: JobKind, failure: FailureReason) -> Self {
        Self::new(Some(job_id), kind, LifecycleEventKind::Failed { failure })
    }

    pub fn drained(kind: JobKind) -> Self {
        Self::new(None, kind, LifecycleEventKind::Drained)
    }

    pub fn error(kind: JobKind, job_id: Option<JobId>, message: impl Into<String>) -> Self {
        Self::new(
            job_id,
            kind,
            LifecycleEventKind::Error {
                message: message.into(),
            },
        )
    }

    pub fn job_id(&self) -> Option<JobId> {
        self.job_id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn event(&self) -> &LifecycleEventKind {
        &self.event
    }

    pub fn into_event(self) -> LifecycleEventKind {
        self.event
    }

    pub fn emitted_at(&self) -> DateTime<Utc> {
        self.emitted_at
    }

    /// `completed` or `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.event,
            LifecycleEventKind::Completed { .. } | LifecycleEventKind::Failed { .. }
        )
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self.event {
            LifecycleEventKind::Started { .. } => "started",
            LifecycleEventKind::Completed { .. } => "completed",
            LifecycleEventKind::Failed { .. } => "failed",
            LifecycleEventKind::Drained => "drained",
            LifecycleEventKind::Error { .. } => "error",
        }
    }
}
