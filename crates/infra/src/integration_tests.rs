//! Integration tests for the full job pipeline.
//!
//! Tests: JobClient → JobQueue → WorkerPool → handler → ack → lifecycle event → CompletionBridge
//!
//! Verifies:
//! - Awaited calls return exactly what a direct handler invocation returns
//! - Retry budgets, validation short-circuits and await timeouts behave end to end
//! - Each job produces exactly one terminal event and no waiter is leaked

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{Value as JsonValue, json};

    use offload_core::{FailureKind, JobId, JobKind};
    use offload_events::LifecycleEvent;
    use offload_tasks::{
        BlobStore, DeleteFileTask, DeletePayload, EmailPayload, InMemoryBlobStore, Mailer, OutgoingEmail,
        JobHandler, RecordingMailer, SendEmailTask, TransportError, UploadFileTask, UploadPayload, handler,
    };

    use crate::config::OffloadConfig;
    use crate::jobs::{JobState, SubmitError};
    use crate::runtime::JobSystem;

    /// Blob store whose every call fails with a connection error.
    #[derive(Default)]
    struct UnreachableBlobStore {
        calls: AtomicU32,
    }

    #[async_trait]
    impl BlobStore for UnreachableBlobStore {
        async fn put(
            &self,
            _key: &str,
            _body: Vec<u8>,
            _content_type: &str,
            _metadata: &BTreeMap<String, String>,
        ) -> Result<String, TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err(TransportError::Connection(format!("reset on attempt {n}")))
        }

        async fn delete(&self, _key: &str) -> Result<(), TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Connection("reset".to_string()))
        }
    }

    /// Mailer that takes a while.
    struct SlowMailer {
        delay: Duration,
        inner: RecordingMailer,
    }

    #[async_trait]
    impl Mailer for SlowMailer {
        async fn send(&self, email: &OutgoingEmail) -> Result<(), TransportError> {
            tokio::time::sleep(self.delay).await;
            self.inner.send(email).await
        }
    }

    fn config() -> OffloadConfig {
        OffloadConfig {
            poll_interval: Duration::from_millis(5),
            ..OffloadConfig::default()
        }
    }

    const WAIT: Duration = Duration::from_secs(5);

    async fn start(mailer: Arc<dyn Mailer>, store: Arc<dyn BlobStore>) -> JobSystem {
        offload_observability::init();
        JobSystem::in_memory(config(), JobSystem::default_handlers(mailer, store))
            .await
            .unwrap()
    }

    /// Collect lifecycle events for `job_id` until its terminal one, then
    /// keep listening briefly for duplicates.
    async fn terminal_events(events: &mut offload_events::Subscription<LifecycleEvent>, job_id: JobId) -> usize {
        let mut terminal = 0;
        let mut deadline = WAIT;
        while let Ok(event) = events.recv_timeout(deadline).await {
            if event.job_id() == Some(job_id) && event.is_terminal() {
                terminal += 1;
                deadline = Duration::from_millis(50);
            }
        }
        terminal
    }

    #[tokio::test]
    async fn scenario_a_email_round_trip() {
        let mailer = Arc::new(RecordingMailer::new());
        let system = start(mailer.clone(), Arc::new(InMemoryBlobStore::new("media"))).await;

        let payload = EmailPayload::new("ada@example.com", "Welcome", "./welcome");
        let receipt = system
            .client()
            .call::<SendEmailTask>(&payload, WAIT)
            .await
            .unwrap();

        assert_eq!(receipt.recipients, vec!["ada@example.com".to_string()]);
        assert_eq!(receipt.template, "./welcome");
        assert_eq!(mailer.sent().len(), 1);
        assert_eq!(system.client().pending_count(), 0);

        system.shutdown().await;
    }

    #[tokio::test]
    async fn scenario_b_transient_upload_failure_exhausts_attempts() {
        let store = Arc::new(UnreachableBlobStore::default());
        let system = start(Arc::new(RecordingMailer::new()), store.clone()).await;
        let mut events = system
            .queue(JobKind::UploadFile)
            .unwrap()
            .subscribe()
            .await
            .unwrap();

        let payload = UploadPayload::new("scan.pdf", "application/pdf", vec![1, 2, 3]);
        let job_id = system.client().fire_task::<UploadFileTask>(&payload).await.unwrap();
        let err = system
            .client()
            .wait(JobKind::UploadFile, job_id, WAIT)
            .await
            .unwrap_err();

        let SubmitError::Failed(failure) = err else {
            panic!("expected failure, got {err:?}");
        };
        assert_eq!(failure.kind, FailureKind::Transient);
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.message, "connection failed: reset on attempt 3");
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert_eq!(terminal_events(&mut events, job_id).await, 1);

        system.shutdown().await;
    }

    #[tokio::test]
    async fn scenario_c_await_timeout_does_not_cancel_the_job() {
        let mailer = Arc::new(SlowMailer {
            delay: Duration::from_millis(200),
            inner: RecordingMailer::new(),
        });
        let system = start(mailer.clone(), Arc::new(InMemoryBlobStore::new("media"))).await;

        let payload = serde_json::to_value(EmailPayload::new("bob@example.com", "Hi", "./hello")).unwrap();
        let err = system
            .client()
            .submit_and_wait(JobKind::SendEmail, payload, Duration::from_millis(20))
            .await
            .unwrap_err();

        let SubmitError::AwaitTimeout { job_id, waited } = err else {
            panic!("expected timeout, got {err:?}");
        };
        assert_eq!(waited, Duration::from_millis(20));
        assert_eq!(system.client().pending_count(), 0);

        // the job still completes
        let late = system.client().wait(JobKind::SendEmail, job_id, WAIT).await.unwrap();
        assert_eq!(late["recipients"], json!(["bob@example.com"]));
        assert_eq!(mailer.inner.sent().len(), 1);

        let job = system.queue(JobKind::SendEmail).unwrap().get(job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(system.client().pending_count(), 0);

        system.shutdown().await;
    }

    #[tokio::test]
    async fn scenario_d_delete_without_key_fails_validation() {
        let store = Arc::new(UnreachableBlobStore::default());
        let system = start(Arc::new(RecordingMailer::new()), store.clone()).await;

        let err = system
            .client()
            .submit_and_wait(JobKind::DeleteFile, json!({}), WAIT)
            .await
            .unwrap_err();

        let SubmitError::Failed(failure) = err else {
            panic!("expected failure, got {err:?}");
        };
        assert_eq!(failure.kind, FailureKind::Validation);
        assert_eq!(failure.attempts, 1);
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);

        system.shutdown().await;
    }

    #[tokio::test]
    async fn awaited_result_matches_direct_invocation() {
        let store = Arc::new(InMemoryBlobStore::new("media"));
        store.put("old.png", vec![1], "image/png", &BTreeMap::new()).await.unwrap();
        let system = start(Arc::new(RecordingMailer::new()), store.clone()).await;

        let email = serde_json::to_value(
            EmailPayload::new("ada@example.com", "Welcome", "./welcome").with_context("name", json!("Ada")),
        )
        .unwrap();
        let delete = serde_json::to_value(DeletePayload::new(store.url_for("old.png"))).unwrap();

        let direct_email: JsonValue = handler(SendEmailTask::new(Arc::new(RecordingMailer::new())))
            .execute(email.clone())
            .await
            .unwrap();
        let direct_delete: JsonValue = handler(DeleteFileTask::new(Arc::new(InMemoryBlobStore::new("media"))))
            .execute(delete.clone())
            .await
            .unwrap();

        assert_eq!(
            system.submit_and_wait(JobKind::SendEmail, email).await.unwrap(),
            direct_email
        );
        assert_eq!(
            system.submit_and_wait(JobKind::DeleteFile, delete).await.unwrap(),
            direct_delete
        );
        assert!(store.get("old.png").is_none());

        system.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_waiters_all_resolve_and_leave_no_registrations() {
        let mailer = Arc::new(RecordingMailer::new());
        let system = Arc::new(start(mailer.clone(), Arc::new(InMemoryBlobStore::new("media"))).await);

        let calls: Vec<_> = (0..20)
            .map(|i| {
                let system = system.clone();
                tokio::spawn(async move {
                    let payload = EmailPayload::new(format!("user{i}@example.com"), "Hi", "./hello");
                    system.client().call::<SendEmailTask>(&payload, WAIT).await
                })
            })
            .collect();

        for (i, call) in calls.into_iter().enumerate() {
            let receipt = call.await.unwrap().unwrap();
            assert_eq!(receipt.recipients, vec![format!("user{i}@example.com")]);
        }
        assert_eq!(mailer.sent().len(), 20);
        assert_eq!(system.client().pending_count(), 0);

        let stats = system.pool_stats(JobKind::SendEmail).unwrap();
        assert_eq!(stats.jobs_failed, 0);
    }

    #[tokio::test]
    async fn fire_and_forget_is_processed() {
        let store = Arc::new(InMemoryBlobStore::new("media"));
        let system = start(Arc::new(RecordingMailer::new()), store.clone()).await;
        let mut events = system
            .queue(JobKind::UploadFile)
            .unwrap()
            .subscribe()
            .await
            .unwrap();

        let job_id = system
            .client()
            .fire_task::<UploadFileTask>(&UploadPayload::new("Photo One.png", "image/png", vec![7]))
            .await
            .unwrap();

        assert_eq!(terminal_events(&mut events, job_id).await, 1);
        let job = system.queue(JobKind::UploadFile).unwrap().get(job_id).await.unwrap().unwrap();
        let key = job.result.unwrap()["key"].as_str().unwrap().to_string();
        assert!(key.starts_with("photo-one_"));
        assert_eq!(store.get(&key).unwrap().body, vec![7]);

        system.shutdown().await;
    }
}
