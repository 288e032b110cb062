//! Outbound email delivery.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use offload_core::{JobKind, TaskError};

use crate::task::{Payload, Task};
use crate::transport::TransportError;

/// One address or several.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Recipients {
    One(String),
    Many(Vec<String>),
}

impl Recipients {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Recipients::One(addr) => vec![addr.clone()],
            Recipients::Many(addrs) => addrs.clone(),
        }
    }

    fn as_json(&self) -> JsonValue {
        match self {
            Recipients::One(addr) => JsonValue::String(addr.clone()),
            Recipients::Many(addrs) => {
                JsonValue::Array(addrs.iter().cloned().map(JsonValue::String).collect())
            }
        }
    }
}

/// Payload of a `send_email` job.
///
/// `template` names a template the mail transport renders with `context`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailPayload {
    pub to: Recipients,
    pub subject: String,
    pub template: String,
    #[serde(default)]
    pub context: Map<String, JsonValue>,
}

impl EmailPayload {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            to: Recipients::One(to.into()),
            subject: subject.into(),
            template: template.into(),
            context: Map::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

impl Payload for EmailPayload {
    fn validate(&self) -> Result<(), TaskError> {
        let recipients = self.to.to_vec();
        if recipients.is_empty() {
            return Err(TaskError::validation("email: at least one recipient is required"));
        }
        if let Some(bad) = recipients.iter().find(|r| !r.contains('@') || r.trim() != r.as_str()) {
            return Err(TaskError::validation(format!("email: invalid recipient {bad:?}")));
        }
        if self.subject.trim().is_empty() {
            return Err(TaskError::validation("email: subject is required"));
        }
        if self.template.trim().is_empty() {
            return Err(TaskError::validation("email: template is required"));
        }
        Ok(())
    }
}

/// A fully resolved message handed to the mail transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingEmail {
    pub to: Vec<String>,
    pub subject: String,
    pub template: String,
    /// Template context; always carries `email` (the recipient field as given)
    /// unless the caller supplied its own.
    pub context: Map<String, JsonValue>,
}

impl From<EmailPayload> for OutgoingEmail {
    fn from(payload: EmailPayload) -> Self {
        let mut context = Map::new();
        context.insert("email".to_string(), payload.to.as_json());
        context.extend(payload.context);

        Self {
            to: payload.to.to_vec(),
            subject: payload.subject,
            template: payload.template,
            context,
        }
    }
}

/// Mail transport boundary (SMTP relay, provider API, ...).
#[async_trait]
pub trait Mailer: Send + Sync + 'static {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), TransportError>;
}

/// Output of a successful `send_email` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailReceipt {
    pub recipients: Vec<String>,
    pub template: String,
}

/// Sends one templated email per job.
#[derive(Clone)]
pub struct SendEmailTask {
    mailer: Arc<dyn Mailer>,
}

impl SendEmailTask {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl Task for SendEmailTask {
    const KIND: JobKind = JobKind::SendEmail;

    type Payload = EmailPayload;
    type Output = EmailReceipt;

    async fn execute(&self, payload: EmailPayload) -> Result<EmailReceipt, TaskError> {
        let email = OutgoingEmail::from(payload);
        self.mailer.send(&email).await?;

        debug!(recipients = ?email.to, template = %email.template, "email sent");
        Ok(EmailReceipt {
            recipients: email.to,
            template: email.template,
        })
    }
}

/// Mailer that records messages instead of sending them (tests/dev).
#[derive(Debug, Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutgoingEmail>>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), TransportError> {
        self.sent
            .lock()
            .map_err(|_| TransportError::Connection("recording mailer poisoned".to_string()))?
            .push(email.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::task::{JobHandler, handler};
    use offload_core::FailureKind;

    struct RefusingMailer(TransportError);

    #[async_trait]
    impl Mailer for RefusingMailer {
        async fn send(&self, _email: &OutgoingEmail) -> Result<(), TransportError> {
            Err(self.0.clone())
        }
    }

    #[tokio::test]
    async fn sends_with_merged_context() {
        let mailer = Arc::new(RecordingMailer::new());
        let task = SendEmailTask::new(mailer.clone());

        let receipt = task
            .execute(EmailPayload::new("ada@example.com", "Welcome", "./welcome").with_context("name", json!("Ada")))
            .await
            .unwrap();

        assert_eq!(receipt.recipients, vec!["ada@example.com".to_string()]);
        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].context["email"], json!("ada@example.com"));
        assert_eq!(sent[0].context["name"], json!("Ada"));
    }

    #[tokio::test]
    async fn accepts_recipient_lists() {
        let mailer = Arc::new(RecordingMailer::new());
        let h = handler(SendEmailTask::new(mailer.clone()));

        let out = h
            .execute(json!({
                "to": ["a@example.com", "b@example.com"],
                "subject": "New login",
                "template": "./login"
            }))
            .await
            .unwrap();

        assert_eq!(out["recipients"], json!(["a@example.com", "b@example.com"]));
        assert_eq!(mailer.sent()[0].to.len(), 2);
    }

    #[test]
    fn missing_template_fails_validation() {
        let h = handler(SendEmailTask::new(Arc::new(RecordingMailer::new())));
        let err = h
            .validate(&json!({"to": "a@example.com", "subject": "Hi"}))
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Validation);
    }

    #[test]
    fn blank_subject_fails_validation() {
        let payload = EmailPayload::new("a@example.com", "  ", "./welcome");
        assert_eq!(payload.validate().unwrap_err().kind, FailureKind::Validation);
    }

    #[test]
    fn empty_recipient_list_fails_validation() {
        let mut payload = EmailPayload::new("a@example.com", "Hi", "./welcome");
        payload.to = Recipients::Many(vec![]);
        assert_eq!(payload.validate().unwrap_err().kind, FailureKind::Validation);
    }

    #[tokio::test]
    async fn transport_errors_keep_their_category() {
        let task = SendEmailTask::new(Arc::new(RefusingMailer(TransportError::Timeout("smtp".into()))));
        let err = task
            .execute(EmailPayload::new("a@example.com", "Hi", "./welcome"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Transient);

        let task = SendEmailTask::new(Arc::new(RefusingMailer(TransportError::Rejected("spam".into()))));
        let err = task
            .execute(EmailPayload::new("a@example.com", "Hi", "./welcome"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Permanent);
    }
}
