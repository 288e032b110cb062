//! Errors reported by the external collaborators (mail transport, blob store).

use thiserror::Error;

use offload_core::{FailureKind, TaskError};

/// Failure reported by a transport adapter.
///
/// Adapters pick the variant; the variant decides retryability.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl TransportError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            TransportError::Connection(_)
            | TransportError::Timeout(_)
            | TransportError::Throttled(_) => FailureKind::Transient,
            TransportError::Rejected(_)
            | TransportError::Unauthorized(_)
            | TransportError::NotFound(_) => FailureKind::Permanent,
        }
    }
}

impl From<TransportError> for TaskError {
    fn from(err: TransportError) -> Self {
        TaskError::new(err.failure_kind(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_class_errors_are_transient() {
        for err in [
            TransportError::Connection("reset".into()),
            TransportError::Timeout("30s".into()),
            TransportError::Throttled("slow down".into()),
        ] {
            assert!(TaskError::from(err).is_retryable());
        }
    }

    #[test]
    fn refusals_are_permanent() {
        let err: TaskError = TransportError::Unauthorized("bad key".into()).into();
        assert_eq!(err.kind, FailureKind::Permanent);
        assert_eq!(err.message, "unauthorized: bad key");
    }
}
