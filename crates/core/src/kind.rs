//! Job kinds and the queue partition each one maps to.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Job kind, used to route a job to its queue and handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Outbound email delivery
    SendEmail,
    /// Blob-store upload
    UploadFile,
    /// Blob-store deletion
    DeleteFile,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::SendEmail, JobKind::UploadFile, JobKind::DeleteFile];

    /// Broker-level queue name for this kind.
    pub fn queue_name(&self) -> &'static str {
        match self {
            JobKind::SendEmail => "email",
            JobKind::UploadFile => "upload",
            JobKind::DeleteFile => "delete",
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            JobKind::SendEmail => "send_email",
            JobKind::UploadFile => "upload_file",
            JobKind::DeleteFile => "delete_file",
        }
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.type_name())
    }
}

impl FromStr for JobKind {
    type Err = CoreError;

    /// Accepts either the type name (`send_email`) or the queue name (`email`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|k| k.type_name() == s || k.queue_name() == s)
            .ok_or_else(|| CoreError::UnknownJobKind(s.to_string()))
    }
}
