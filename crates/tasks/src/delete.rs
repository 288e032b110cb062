//! Blob-store deletions.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use offload_core::{JobKind, TaskError};

use crate::blob::BlobStore;
use crate::task::{Payload, Task};

/// Payload of a `delete_file` job: an object key or the object's full URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletePayload {
    pub key: String,
}

impl DeletePayload {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    /// The bare object key (`https://bucket.host/a/b.png?x=1` → `a/b.png`).
    pub fn object_key(&self) -> &str {
        let key = self.key.trim();
        let Some(rest) = key
            .strip_prefix("https://")
            .or_else(|| key.strip_prefix("http://"))
        else {
            return key;
        };
        let path = rest.split_once('/').map(|(_, path)| path).unwrap_or_default();
        path.split(['?', '#']).next().unwrap_or_default()
    }
}

impl Payload for DeletePayload {
    fn validate(&self) -> Result<(), TaskError> {
        if self.object_key().is_empty() {
            return Err(TaskError::validation("delete: key is required"));
        }
        Ok(())
    }
}

/// Output of a successful `delete_file` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteReceipt {
    pub key: String,
}

/// Deletes one object per job. Idempotent.
#[derive(Clone)]
pub struct DeleteFileTask {
    store: Arc<dyn BlobStore>,
}

impl DeleteFileTask {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Task for DeleteFileTask {
    const KIND: JobKind = JobKind::DeleteFile;

    type Payload = DeletePayload;
    type Output = DeleteReceipt;

    async fn execute(&self, payload: DeletePayload) -> Result<DeleteReceipt, TaskError> {
        let key = payload.object_key().to_string();
        self.store.delete(&key).await?;

        debug!(key = %key, "file deleted");
        Ok(DeleteReceipt { key })
    }
}
