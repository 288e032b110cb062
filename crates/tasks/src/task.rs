//! Handler contract: typed tasks and their JSON-erased form.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use offload_core::{JobKind, TaskError};

/// A job payload: what a caller enqueues for one kind of task.
///
/// Deserialization enforces presence and types of fields; `validate` covers
/// whatever serde cannot express (blank strings, allowed values).
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn validate(&self) -> Result<(), TaskError> {
        Ok(())
    }
}

/// A typed unit of work for one job kind.
///
/// Implementations must be idempotent or tolerate duplicate execution: the
/// queue delivers at least once.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    const KIND: JobKind;

    type Payload: Payload;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    async fn execute(&self, payload: Self::Payload) -> Result<Self::Output, TaskError>;
}

/// Type-erased handler the worker pool drives.
///
/// Payloads and results travel as JSON, the way the broker stores them.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    fn kind(&self) -> JobKind;

    /// Shape check run before any execution. Failures here are never retried.
    fn validate(&self, payload: &JsonValue) -> Result<(), TaskError>;

    async fn execute(&self, payload: JsonValue) -> Result<JsonValue, TaskError>;
}

/// Adapts a typed [`Task`] into a [`JobHandler`].
#[derive(Debug, Clone)]
pub struct TaskAdapter<T> {
    task: T,
}

impl<T: Task> TaskAdapter<T> {
    pub fn new(task: T) -> Self {
        Self { task }
    }

    pub fn task(&self) -> &T {
        &self.task
    }
}

/// Erase a task into a shareable handler.
pub fn handler<T: Task>(task: T) -> Arc<dyn JobHandler> {
    Arc::new(TaskAdapter::new(task))
}

fn decode<P: Payload>(payload: &JsonValue) -> Result<P, TaskError> {
    let decoded: P = serde_json::from_value(payload.clone())
        .map_err(|e| TaskError::validation(format!("malformed payload: {e}")))?;
    decoded.validate()?;
    Ok(decoded)
}

#[async_trait]
impl<T: Task> JobHandler for TaskAdapter<T> {
    fn kind(&self) -> JobKind {
        T::KIND
    }

    fn validate(&self, payload: &JsonValue) -> Result<(), TaskError> {
        decode::<T::Payload>(payload).map(|_| ())
    }

    async fn execute(&self, payload: JsonValue) -> Result<JsonValue, TaskError> {
        let payload = decode::<T::Payload>(&payload)?;
        let output = self.task.execute(payload).await?;
        serde_json::to_value(output)
            .map_err(|e| TaskError::permanent(format!("unserializable task output: {e}")))
    }
}
