//! Submission API.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;

use offload_core::{JobId, JobKind};
use offload_tasks::Task;

use super::bridge::{CompletionBridge, SubmitError};
use super::queue::{JobQueue, QueueError};

/// Producer-side entry point: route a payload to its kind's queue, either
/// fire-and-forget or awaiting the outcome.
#[derive(Clone, Default)]
pub struct JobClient {
    bridges: HashMap<JobKind, Arc<CompletionBridge>>,
}

impl JobClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `queue.kind()` jobs to `queue`, replacing any previous route.
    pub async fn register(&mut self, queue: Arc<dyn JobQueue>) -> Result<(), QueueError> {
        let bridge = CompletionBridge::start(queue).await?;
        self.bridges.insert(bridge.kind(), Arc::new(bridge));
        Ok(())
    }

    pub fn bridge(&self, kind: JobKind) -> Result<&Arc<CompletionBridge>, SubmitError> {
        self.bridges.get(&kind).ok_or(SubmitError::UnknownQueue(kind))
    }

    pub fn kinds(&self) -> impl Iterator<Item = JobKind> + '_ {
        self.bridges.keys().copied()
    }

    /// Enqueue and return immediately.
    pub async fn fire(&self, kind: JobKind, payload: JsonValue) -> Result<JobId, SubmitError> {
        Ok(self.bridge(kind)?.queue().enqueue(payload).await?)
    }

    /// Enqueue and wait up to `timeout` for the job's result.
    pub async fn submit_and_wait(
        &self,
        kind: JobKind,
        payload: JsonValue,
        timeout: Duration,
    ) -> Result<JsonValue, SubmitError> {
        self.bridge(kind)?.submit_and_wait(payload, timeout).await
    }

    /// Wait for a job enqueued earlier with [`JobClient::fire`].
    pub async fn wait(&self, kind: JobKind, job_id: JobId, timeout: Duration) -> Result<JsonValue, SubmitError> {
        self.bridge(kind)?.wait(job_id, timeout).await
    }

    /// Typed [`JobClient::fire`].
    pub async fn fire_task<T: Task>(&self, payload: &T::Payload) -> Result<JobId, SubmitError> {
        self.fire(T::KIND, encode(payload)?).await
    }

    /// Typed [`JobClient::submit_and_wait`].
    pub async fn call<T: Task>(&self, payload: &T::Payload, timeout: Duration) -> Result<T::Output, SubmitError> {
        let result = self.submit_and_wait(T::KIND, encode(payload)?, timeout).await?;
        serde_json::from_value(result).map_err(|e| SubmitError::Decode(e.to_string()))
    }

    /// Waiters currently registered across all queues.
    pub fn pending_count(&self) -> usize {
        self.bridges.values().map(|b| b.pending_count()).sum()
    }
}

fn encode<P: serde::Serialize>(payload: &P) -> Result<JsonValue, SubmitError> {
    serde_json::to_value(payload).map_err(|e| SubmitError::Broker(QueueError::from(e)))
}
