//! Blob-store uploads.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use offload_core::{JobKind, TaskError};

use crate::blob::BlobStore;
use crate::task::{Payload, Task};

/// Content types accepted for upload.
pub const ALLOWED_CONTENT_TYPES: [&str; 3] = ["image/jpeg", "image/png", "application/pdf"];

/// Payload of an `upload_file` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadPayload {
    /// Client-side file name; the stored key is derived from it.
    pub original_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    /// Stored alongside the object as user metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl UploadPayload {
    pub fn new(original_name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            original_name: original_name.into(),
            content_type: content_type.into(),
            bytes,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl Payload for UploadPayload {
    fn validate(&self) -> Result<(), TaskError> {
        if self.original_name.trim().is_empty() {
            return Err(TaskError::validation("upload: original_name is required"));
        }
        if self.bytes.is_empty() {
            return Err(TaskError::validation("upload: file is empty"));
        }
        if !ALLOWED_CONTENT_TYPES.contains(&self.content_type.as_str()) {
            return Err(TaskError::validation(format!(
                "upload: invalid file type {}; only JPEG, PNG and PDF are allowed",
                self.content_type
            )));
        }
        Ok(())
    }
}

/// Output of a successful `upload_file` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub key: String,
    pub url: String,
}

/// Derive a collision-resistant object key from a client file name.
///
/// `"My Report.PDF"` at 2024-05-01T10:20:30.456Z becomes
/// `"my-report_20240501T102030456Z"`: extension dropped, whitespace runs
/// collapsed to `-`, lowercased, UTC timestamp appended.
pub fn object_key(original_name: &str, at: DateTime<Utc>) -> String {
    let file_name = original_name
        .trim()
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let stem = match file_name.rfind('.') {
        Some(idx) if idx > 0 => &file_name[..idx],
        _ => file_name,
    };
    let base = stem
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase();

    format!("{}_{}", base, at.format("%Y%m%dT%H%M%S%3fZ"))
}

/// Uploads one file per job.
///
/// Duplicate executions store the file under two keys; the caller only ever
/// sees the key of the attempt that completed.
#[derive(Clone)]
pub struct UploadFileTask {
    store: Arc<dyn BlobStore>,
}

impl UploadFileTask {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Task for UploadFileTask {
    const KIND: JobKind = JobKind::UploadFile;

    type Payload = UploadPayload;
    type Output = UploadReceipt;

    async fn execute(&self, payload: UploadPayload) -> Result<UploadReceipt, TaskError> {
        let key = object_key(&payload.original_name, Utc::now());
        let url = self
            .store
            .put(&key, payload.bytes, &payload.content_type, &payload.metadata)
            .await?;

        debug!(key = %key, url = %url, "file uploaded");
        Ok(UploadReceipt { key, url })
    }
}
