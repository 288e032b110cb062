//! `offload-tasks`
//!
//! **Responsibility:** the work itself, one handler per job kind.
//!
//! Handlers know nothing about queues:
//! - They take a typed payload and return a typed output or a [`TaskError`].
//! - Retryability is declared on the error's [`FailureKind`], never guessed.
//! - Mail transport and blob store are injected collaborators.
//!
//! [`TaskError`]: offload_core::TaskError
//! [`FailureKind`]: offload_core::FailureKind

pub mod blob;
pub mod delete;
pub mod email;
pub mod task;
pub mod transport;
pub mod upload;

pub use blob::{BlobStore, InMemoryBlobStore};
pub use delete::{DeleteFileTask, DeletePayload, DeleteReceipt};
pub use email::{EmailPayload, EmailReceipt, Mailer, OutgoingEmail, Recipients, RecordingMailer, SendEmailTask};
pub use task::{JobHandler, Payload, Task, TaskAdapter, handler};
pub use transport::TransportError;
pub use upload::{UploadFileTask, UploadPayload, UploadReceipt};
