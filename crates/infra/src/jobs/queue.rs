//! Job queue abstraction and the in-memory broker.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use offload_core::{JobId, JobKind, TaskError};
use offload_events::{EventBus, InMemoryEventBus, LifecycleEvent, Subscription};

use super::types::{AckOutcome, InvalidTransition, Job, JobState, QueueStats, RetryPolicy, saturating_sub};

const RESUBSCRIBE_MIN_DELAY: Duration = Duration::from_millis(50);
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(5);

/// Queue error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {id} is not active (state: {state:?})")]
    NotActive { id: JobId, state: JobState },
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<InvalidTransition> for QueueError {
    fn from(err: InvalidTransition) -> Self {
        QueueError::NotActive {
            id: err.id,
            state: err.state,
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

/// Per-queue delivery settings.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueOptions {
    pub retry: RetryPolicy,
    /// How long a lease stays valid before the job is redelivered.
    pub lease_timeout: Duration,
    /// How long finished jobs stay readable.
    pub retention: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            lease_timeout: Duration::from_secs(30),
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl QueueOptions {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

/// A durable, FIFO, at-least-once queue for one job kind.
///
/// The queue owns every state transition of its jobs. Workers *request*
/// transitions through `lease` and the `acknowledge_*` operations; terminal
/// transitions publish a lifecycle event on the queue's stream.
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    /// The job kind this queue carries.
    fn kind(&self) -> JobKind;

    /// Append a new waiting job. Does not wait for processing.
    async fn enqueue(&self, payload: JsonValue) -> Result<JobId, QueueError>;

    /// Lease the oldest ready waiting job, if any.
    ///
    /// The returned job is `Active` with `attempts` already incremented.
    async fn lease(&self) -> Result<Option<Job>, QueueError>;

    /// `Active → Completed`; publishes `completed`.
    async fn acknowledge_complete(&self, job_id: JobId, result: JsonValue) -> Result<(), QueueError>;

    /// Requeue at the tail when `retryable` and attempts remain, else
    /// `Active → Failed` and publish `failed`.
    async fn acknowledge_failed(
        &self,
        job_id: JobId,
        error: TaskError,
        retryable: bool,
    ) -> Result<AckOutcome, QueueError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Broadcast a worker-originated event (`started`, `drained`, `error`).
    async fn publish(&self, event: LifecycleEvent) -> Result<(), QueueError>;

    /// Subscribe to this queue's lifecycle stream.
    async fn subscribe(&self) -> Result<Subscription<LifecycleEvent>, QueueError>;
}

/// Subscribe again after a lifecycle stream ended, backing off between
/// attempts until the broker accepts.
pub async fn resubscribe(queue: &dyn JobQueue) -> Subscription<LifecycleEvent> {
    let mut delay = RESUBSCRIBE_MIN_DELAY;
    loop {
        tokio::time::sleep(delay).await;
        match queue.subscribe().await {
            Ok(events) => {
                info!(queue = queue.kind().queue_name(), "lifecycle stream resubscribed");
                return events;
            }
            Err(e) => {
                warn!(queue = queue.kind().queue_name(), error = %e, retry_in = ?delay, "resubscribe failed");
                delay = (delay * 2).min(RESUBSCRIBE_MAX_DELAY);
            }
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<JobId, Job>,
    /// Waiting job ids in delivery order.
    waiting: VecDeque<JobId>,
    /// Terminal job ids in the order they finished.
    finished: VecDeque<(DateTime<Utc>, JobId)>,
}

impl QueueState {
    fn finish(&mut self, id: JobId, at: DateTime<Utc>) {
        self.finished.push_back((at, id));
    }

    /// Drop terminal jobs that finished at or before `cutoff`.
    fn prune(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut pruned = 0;
        while let Some(&(at, id)) = self.finished.front() {
            if at > cutoff {
                break;
            }
            self.finished.pop_front();
            if self.jobs.remove(&id).is_some() {
                pruned += 1;
            }
        }
        pruned
    }

    /// Redeliver or fail jobs whose lease passed. Returns the `failed` events
    /// to publish.
    fn reclaim_expired(&mut self, kind: JobKind, policy: &RetryPolicy, now: DateTime<Utc>) -> Vec<LifecycleEvent> {
        let mut expired: Vec<_> = self
            .jobs
            .values()
            .filter(|j| j.lease_expired(now))
            .map(|j| (j.lease_expires_at, j.id))
            .collect();
        expired.sort();

        let mut events = Vec::new();
        for (_, id) in expired {
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            let error = TaskError::transient("lease expired");

            if job.can_retry() {
                let delay = policy.delay_for_attempt(job.attempts);
                if job.mark_requeued(&error, delay).is_ok() {
                    warn!(job_id = %id, queue = kind.queue_name(), attempt = job.attempts, "lease expired, job redelivered");
                    self.waiting.push_back(id);
                }
            } else if let Ok(failure) = job.mark_failed(error) {
                warn!(job_id = %id, queue = kind.queue_name(), attempt = job.attempts, "lease expired, attempts exhausted");
                let at = job.updated_at;
                events.push(LifecycleEvent::failed(id, kind, failure));
                self.finish(id, at);
            }
        }
        events
    }

    fn next_ready(&mut self, now: DateTime<Utc>) -> Option<JobId> {
        let jobs = &self.jobs;
        let pos = self
            .waiting
            .iter()
            .position(|id| jobs.get(id).is_some_and(|j| j.is_ready(now)))?;
        self.waiting.remove(pos)
    }
}

/// In-memory queue for tests/dev and single-process deployments.
///
/// Finished jobs are dropped once they are older than
/// [`QueueOptions::retention`]; pruning runs on `enqueue` and `lease`.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    kind: JobKind,
    options: QueueOptions,
    state: Mutex<QueueState>,
    events: InMemoryEventBus<LifecycleEvent>,
}

impl InMemoryJobQueue {
    pub fn new(kind: JobKind) -> Self {
        Self::with_options(kind, QueueOptions::default())
    }

    pub fn with_options(kind: JobKind, options: QueueOptions) -> Self {
        Self {
            kind,
            options,
            state: Mutex::new(QueueState::default()),
            events: InMemoryEventBus::new(),
        }
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Drop terminal jobs that finished more than `older_than` ago.
    pub fn prune_finished(&self, older_than: Duration) -> Result<usize, QueueError> {
        let cutoff = saturating_sub(Utc::now(), older_than);
        Ok(self.lock()?.prune(cutoff))
    }

    fn retention_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        saturating_sub(now, self.options.retention)
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::BrokerUnavailable("in-memory queue lock poisoned".to_string()))
    }

    async fn broadcast(&self, event: LifecycleEvent) {
        let label = event.label();
        if let Err(e) = self.events.publish(event).await {
            warn!(queue = self.kind.queue_name(), event = label, error = %e, "failed to publish lifecycle event");
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    fn kind(&self) -> JobKind {
        self.kind
    }

    async fn enqueue(&self, payload: JsonValue) -> Result<JobId, QueueError> {
        let job = Job::new(self.kind, payload, self.options.retry.max_attempts);
        let id = job.id;

        let mut state = self.lock()?;
        let pruned = state.prune(self.retention_cutoff(Utc::now()));
        state.jobs.insert(id, job);
        state.waiting.push_back(id);
        drop(state);

        if pruned > 0 {
            debug!(queue = self.kind.queue_name(), pruned, "finished jobs pruned");
        }

        debug!(job_id = %id, queue = self.kind.queue_name(), "job enqueued");
        Ok(id)
    }

    async fn lease(&self) -> Result<Option<Job>, QueueError> {
        let now = Utc::now();
        let (leased, reclaimed) = {
            let mut state = self.lock()?;
            state.prune(self.retention_cutoff(now));
            let reclaimed = state.reclaim_expired(self.kind, &self.options.retry, now);

            let leased = match state.next_ready(now) {
                Some(id) => match state.jobs.get_mut(&id) {
                    Some(job) => {
                        job.mark_active(self.options.lease_timeout)?;
                        Some(job.clone())
                    }
                    None => None,
                },
                None => None,
            };
            (leased, reclaimed)
        };

        for event in reclaimed {
            self.broadcast(event).await;
        }
        Ok(leased)
    }

    async fn acknowledge_complete(&self, job_id: JobId, result: JsonValue) -> Result<(), QueueError> {
        {
            let mut state = self.lock()?;
            let job = state.jobs.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;
            job.mark_completed(result.clone())?;
            let at = job.updated_at;
            state.finish(job_id, at);
        }

        self.broadcast(LifecycleEvent::completed(job_id, self.kind, result))
            .await;
        Ok(())
    }

    async fn acknowledge_failed(
        &self,
        job_id: JobId,
        error: TaskError,
        retryable: bool,
    ) -> Result<AckOutcome, QueueError> {
        let outcome = {
            let mut state = self.lock()?;
            let job = state.jobs.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;

            if retryable && job.state == JobState::Active && job.can_retry() {
                let delay = self.options.retry.delay_for_attempt(job.attempts);
                job.mark_requeued(&error, delay)?;
                let available_at = job.available_at;
                state.waiting.push_back(job_id);
                AckOutcome::Requeued { available_at }
            } else {
                let failure = job.mark_failed(error)?;
                let at = job.updated_at;
                state.finish(job_id, at);
                AckOutcome::Failed(failure)
            }
        };

        if let AckOutcome::Failed(failure) = &outcome {
            self.broadcast(LifecycleEvent::failed(job_id, self.kind, failure.clone()))
                .await;
        }
        Ok(outcome)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.lock()?.jobs.get(&job_id).cloned())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.lock()?;
        let mut stats = QueueStats::default();
        for job in state.jobs.values() {
            match job.state {
                JobState::Waiting => stats.waiting += 1,
                JobState::Active => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn publish(&self, event: LifecycleEvent) -> Result<(), QueueError> {
        self.events
            .publish(event)
            .await
            .map_err(|e| QueueError::BrokerUnavailable(e.to_string()))
    }

    async fn subscribe(&self) -> Result<Subscription<LifecycleEvent>, QueueError> {
        self.events
            .subscribe()
            .await
            .map_err(|e| QueueError::BrokerUnavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use offload_core::FailureKind;
    use offload_events::LifecycleEventKind;

    fn queue(max_attempts: u32) -> InMemoryJobQueue {
        InMemoryJobQueue::with_options(
            JobKind::UploadFile,
            QueueOptions::default().with_retry(RetryPolicy::fixed(max_attempts, Duration::ZERO)),
        )
    }

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn lease_is_fifo_and_increments_attempts() {
        let q = queue(3);
        let a = q.enqueue(json!({"n": 1})).await.unwrap();
        let b = q.enqueue(json!({"n": 2})).await.unwrap();

        let first = q.lease().await.unwrap().unwrap();
        assert_eq!(first.id, a);
        assert_eq!(first.state, JobState::Active);
        assert_eq!(first.attempts, 1);

        assert_eq!(q.lease().await.unwrap().unwrap().id, b);
        assert!(q.lease().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_publishes_terminal_event() {
        let q = queue(3);
        let mut events = q.subscribe().await.unwrap();
        let id = q.enqueue(json!({})).await.unwrap();
        q.lease().await.unwrap();

        q.acknowledge_complete(id, json!({"ok": true})).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.job_id(), Some(id));
        assert_eq!(event.event(), &LifecycleEventKind::Completed { result: json!({"ok": true}) });

        let job = q.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(q.stats().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn ack_on_non_active_job_is_rejected_silently() {
        let q = queue(3);
        let mut events = q.subscribe().await.unwrap();
        let id = q.enqueue(json!({})).await.unwrap();

        let err = q.acknowledge_complete(id, json!(1)).await.unwrap_err();
        assert_eq!(err, QueueError::NotActive { id, state: JobState::Waiting });

        q.lease().await.unwrap();
        q.acknowledge_complete(id, json!(1)).await.unwrap();
        assert!(q.acknowledge_complete(id, json!(2)).await.is_err());
        assert!(q
            .acknowledge_failed(id, TaskError::permanent("late"), false)
            .await
            .is_err());

        assert!(events.recv().await.unwrap().is_terminal());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let q = queue(3);
        let id = JobId::new();
        assert_eq!(
            q.acknowledge_complete(id, json!(null)).await.unwrap_err(),
            QueueError::NotFound(id)
        );
    }

    async fn drain_order(q: &InMemoryJobQueue) -> Vec<JobId> {
        let mut order = Vec::new();
        while let Some(job) = q.lease().await.unwrap() {
            order.push(job.id);
        }
        order
    }

    #[tokio::test]
    async fn retried_job_goes_behind_jobs_that_arrived_during_its_attempt() {
        let q = queue(3);
        let a = q.enqueue(json!("a")).await.unwrap();
        let b = q.enqueue(json!("b")).await.unwrap();

        q.lease().await.unwrap();
        let c = q.enqueue(json!("c")).await.unwrap();
        let outcome = q
            .acknowledge_failed(a, TaskError::transient("reset"), true)
            .await
            .unwrap();
        assert_eq!(outcome, AckOutcome::Requeued { available_at: None });

        assert_eq!(drain_order(&q).await, vec![b, c, a]);
    }

    #[tokio::test]
    async fn jobs_enqueued_after_a_requeue_go_behind_the_retried_job() {
        let q = queue(3);
        let a = q.enqueue(json!("a")).await.unwrap();
        let b = q.enqueue(json!("b")).await.unwrap();

        q.lease().await.unwrap();
        q.acknowledge_failed(a, TaskError::transient("reset"), true)
            .await
            .unwrap();
        let c = q.enqueue(json!("c")).await.unwrap();

        assert_eq!(drain_order(&q).await, vec![b, a, c]);
    }

    #[tokio::test]
    async fn non_retryable_failure_is_terminal() {
        let q = queue(3);
        let id = q.enqueue(json!({})).await.unwrap();
        q.lease().await.unwrap();

        let outcome = q
            .acknowledge_failed(id, TaskError::permanent("access denied"), false)
            .await
            .unwrap();
        let AckOutcome::Failed(failure) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, FailureKind::Permanent);
        assert_eq!(failure.attempts, 1);
    }

    #[tokio::test]
    async fn backoff_delays_redelivery() {
        let q = InMemoryJobQueue::with_options(
            JobKind::SendEmail,
            QueueOptions::default().with_retry(RetryPolicy::fixed(3, Duration::from_secs(60))),
        );
        let id = q.enqueue(json!({})).await.unwrap();
        q.lease().await.unwrap();

        let outcome = q
            .acknowledge_failed(id, TaskError::transient("busy"), true)
            .await
            .unwrap();
        assert!(matches!(outcome, AckOutcome::Requeued { available_at: Some(_) }));
        assert!(q.lease().await.unwrap().is_none());
        assert_eq!(q.stats().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered() {
        let q = InMemoryJobQueue::with_options(
            JobKind::DeleteFile,
            QueueOptions::default()
                .with_retry(RetryPolicy::fixed(2, Duration::ZERO))
                .with_lease_timeout(Duration::ZERO),
        );
        let mut events = q.subscribe().await.unwrap();
        let id = q.enqueue(json!({"key": "a"})).await.unwrap();

        let first = q.lease().await.unwrap().unwrap();
        let second = q.lease().await.unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.attempts, 2);

        // the stale worker's ack is refused
        q.lease().await.unwrap();
        assert!(matches!(
            q.acknowledge_complete(id, json!(null)).await,
            Err(QueueError::NotActive { .. })
        ));

        let event = events.recv().await.unwrap();
        let LifecycleEventKind::Failed { failure } = event.event() else {
            panic!("expected failed event");
        };
        assert_eq!(failure.kind, FailureKind::Transient);
        assert_eq!(failure.message, "lease expired");
        assert_eq!(failure.attempts, 2);
    }

    #[tokio::test]
    async fn prune_finished_keeps_live_jobs() {
        let q = queue(1);
        let done = q.enqueue(json!(1)).await.unwrap();
        let live = q.enqueue(json!(2)).await.unwrap();
        q.lease().await.unwrap();
        q.acknowledge_complete(done, json!(null)).await.unwrap();

        assert_eq!(q.prune_finished(Duration::ZERO).unwrap(), 1);
        assert!(q.get(done).await.unwrap().is_none());
        assert!(q.get(live).await.unwrap().is_some());
        assert_eq!(q.prune_finished(Duration::MAX).unwrap(), 0);
    }

    #[tokio::test]
    async fn finished_jobs_are_dropped_after_retention() {
        let q = InMemoryJobQueue::with_options(
            JobKind::DeleteFile,
            QueueOptions::default()
                .with_retry(RetryPolicy::no_retry())
                .with_retention(Duration::ZERO),
        );
        let done = q.enqueue(json!(1)).await.unwrap();
        let failed = q.enqueue(json!(2)).await.unwrap();
        q.lease().await.unwrap();
        q.lease().await.unwrap();
        q.acknowledge_complete(done, json!(null)).await.unwrap();
        q.acknowledge_failed(failed, TaskError::permanent("gone"), false)
            .await
            .unwrap();
        let stats = q.stats().await.unwrap();
        assert_eq!((stats.completed, stats.failed), (1, 1));

        // the next lease prunes
        assert!(q.lease().await.unwrap().is_none());
        assert!(q.get(done).await.unwrap().is_none());
        assert!(q.get(failed).await.unwrap().is_none());
        assert_eq!(q.stats().await.unwrap(), QueueStats::default());
    }

    #[tokio::test]
    async fn unbounded_durations_do_not_poison_the_queue() {
        let q = InMemoryJobQueue::with_options(
            JobKind::UploadFile,
            QueueOptions::default()
                .with_retry(RetryPolicy::fixed(3, Duration::from_millis(10u64.pow(16))))
                .with_lease_timeout(Duration::MAX)
                .with_retention(Duration::MAX),
        );
        let id = q.enqueue(json!({})).await.unwrap();

        let job = q.lease().await.unwrap().unwrap();
        assert!(job.lease_expires_at.is_some());

        let outcome = q
            .acknowledge_failed(id, TaskError::transient("busy"), true)
            .await
            .unwrap();
        assert!(matches!(outcome, AckOutcome::Requeued { available_at: Some(_) }));

        // still usable
        q.enqueue(json!({})).await.unwrap();
        assert_eq!(q.stats().await.unwrap().waiting, 2);
    }

    proptest! {
        #[test]
        fn attempts_never_exceed_max(max_attempts in 1u32..6, failures in proptest::collection::vec(any::<bool>(), 1..10)) {
            rt().block_on(async {
                let q = queue(max_attempts);
                let id = q.enqueue(json!({})).await.unwrap();

                let mut outcomes = failures.iter().cycle();
                while let Some(job) = q.lease().await.unwrap() {
                    prop_assert!(job.attempts <= max_attempts);
                    let retryable = *outcomes.next().unwrap();
                    let error = if retryable {
                        TaskError::transient("flaky")
                    } else {
                        TaskError::permanent("broken")
                    };
                    q.acknowledge_failed(job.id, error, retryable).await.unwrap();
                }

                let job = q.get(id).await.unwrap().unwrap();
                prop_assert_eq!(job.state, JobState::Failed);
                prop_assert!(job.attempts <= max_attempts);
                prop_assert_eq!(job.failure.map(|f| f.attempts), Some(job.attempts));
                Ok(())
            })?;
        }

        #[test]
        fn retried_jobs_requeue_behind_later_arrivals(n in 1usize..8, retried in 0usize..8) {
            let retried = retried % n;
            rt().block_on(async {
                let q = queue(2);
                let mut ids = Vec::new();
                for i in 0..n {
                    ids.push(q.enqueue(json!(i)).await.unwrap());
                }

                // lease up to and including the retried job; a job arrives
                // during its attempt, another after it is requeued
                for _ in 0..=retried {
                    q.lease().await.unwrap();
                }
                let during = q.enqueue(json!("during")).await.unwrap();
                q.acknowledge_failed(ids[retried], TaskError::transient("x"), true).await.unwrap();
                let after = q.enqueue(json!("after")).await.unwrap();

                let order = drain_order(&q).await;

                let mut expected: Vec<_> = ids[retried + 1..].to_vec();
                expected.push(during);
                expected.push(ids[retried]);
                expected.push(after);
                prop_assert_eq!(order, expected);
                Ok(())
            })?;
        }
    }
}
