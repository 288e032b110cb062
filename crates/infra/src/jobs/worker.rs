//! Worker pool: lease, execute, classify, acknowledge.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use offload_core::{FailureReason, JobKind, TaskError};
use offload_events::{LifecycleEvent, LifecycleEventKind, Subscription};
use offload_tasks::JobHandler;

use super::queue::{JobQueue, QueueError, resubscribe};
use super::types::{AckOutcome, Job};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// How long an idle worker sleeps before leasing again
    pub poll_interval: Duration,
    /// Number of concurrent lease slots
    pub concurrency: usize,
    /// Name for logging
    pub name: String,
    /// Upper bound on a single handler invocation
    pub handler_timeout: Option<Duration>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            concurrency: 1,
            name: "worker-pool".to_string(),
            handler_timeout: None,
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("handler for {handler} cannot serve the {queue} queue")]
    KindMismatch { queue: JobKind, handler: JobKind },
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// What happened to one leased job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    /// Requeued for another attempt.
    Retried,
    Failed(FailureReason),
    /// The queue refused or could not record the outcome; the lease will
    /// expire and the job is redelivered.
    Abandoned(QueueError),
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<PoolStats>>,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Stop leasing, let in-flight jobs finish, and wait for the workers.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!(pool = %self.name, "worker pool stopped");
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let mut stats = self.stats.lock().map(|s| s.clone()).unwrap_or_default();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// `concurrency` workers draining one queue with one handler.
///
/// Workers are stateless between jobs; everything they share lives behind
/// `Arc`s, so cloning the pool is cheap.
#[derive(Clone)]
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    config: WorkerPoolConfig,
    stats: Arc<Mutex<PoolStats>>,
    /// Set on lease, cleared when `drained` is emitted. Held across the
    /// stats read so a lease cannot slip between the read and the reset.
    busy: Arc<AsyncMutex<bool>>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        config: WorkerPoolConfig,
    ) -> Result<Self, WorkerError> {
        if queue.kind() != handler.kind() {
            return Err(WorkerError::KindMismatch {
                queue: queue.kind(),
                handler: handler.kind(),
            });
        }
        Ok(Self {
            queue,
            handler,
            config,
            stats: Arc::new(Mutex::new(PoolStats::default())),
            busy: Arc::new(AsyncMutex::new(false)),
        })
    }

    pub fn kind(&self) -> JobKind {
        self.queue.kind()
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Start the workers and the lifecycle logger.
    pub async fn spawn(self) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(self.config.concurrency + 1);

        match self.queue.subscribe().await {
            Ok(events) => {
                let name = self.config.name.clone();
                let queue = self.queue.clone();
                tasks.push(tokio::spawn(log_lifecycle(name, queue, events, shutdown_rx.clone())));
            }
            Err(e) => {
                warn!(pool = %self.config.name, error = %e, "lifecycle logging unavailable");
            }
        }

        for worker in 0..self.config.concurrency.max(1) {
            let pool = self.clone();
            tasks.push(tokio::spawn(pool.worker_loop(worker, shutdown_rx.clone())));
        }

        info!(
            pool = %self.config.name,
            queue = self.kind().queue_name(),
            concurrency = self.config.concurrency,
            "worker pool started"
        );

        WorkerPoolHandle {
            name: self.config.name,
            shutdown: shutdown_tx,
            tasks,
            stats: self.stats,
            started: Instant::now(),
        }
    }

    async fn worker_loop(self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(pool = %self.config.name, worker, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.queue.lease().await {
                Ok(Some(job)) => {
                    self.mark_busy().await;
                    debug!(
                        pool = %self.config.name,
                        job_id = %job.id,
                        attempt = job.attempts,
                        "leased job"
                    );

                    self.update_stats(|s| s.current_running += 1);
                    let outcome = self.process(job).await;
                    self.record(&outcome);

                    if let JobOutcome::Abandoned(QueueError::BrokerUnavailable(_)) = outcome {
                        self.pause(&mut shutdown).await;
                    }
                    self.check_drained().await;
                }
                Ok(None) => {
                    self.check_drained().await;
                    self.pause(&mut shutdown).await;
                }
                Err(e) => {
                    error!(pool = %self.config.name, error = %e, "failed to lease job");
                    self.report_error(None, &e).await;
                    self.pause(&mut shutdown).await;
                }
            }
        }

        debug!(pool = %self.config.name, worker, "worker stopped");
    }

    /// Run one leased job to an acknowledged outcome.
    pub async fn process(&self, job: Job) -> JobOutcome {
        let kind = self.kind();
        self.emit(LifecycleEvent::started(job.id, kind, job.attempts))
            .await;

        if let Err(err) = self.handler.validate(&job.payload) {
            let err = TaskError::validation(err.message);
            return self.fail(&job, err, false).await;
        }

        match self.run_handler(job.payload.clone()).await {
            Ok(result) => match self.queue.acknowledge_complete(job.id, result).await {
                Ok(()) => {
                    debug!(job_id = %job.id, queue = kind.queue_name(), "job completed");
                    JobOutcome::Completed
                }
                Err(e) => self.abandon(&job, e).await,
            },
            Err(err) => {
                let retryable = err.is_retryable() && job.attempts < job.max_attempts;
                self.fail(&job, err, retryable).await
            }
        }
    }

    async fn run_handler(&self, payload: JsonValue) -> Result<JsonValue, TaskError> {
        let handler = self.handler.clone();
        let mut task = tokio::spawn(async move { handler.execute(payload).await });

        let joined = match self.config.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    return Err(TaskError::transient(format!(
                        "handler timed out after {}ms",
                        limit.as_millis()
                    )));
                }
            },
            None => task.await,
        };

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(TaskError::permanent("handler panicked")),
            Err(e) => Err(TaskError::permanent(format!("handler aborted: {e}"))),
        }
    }

    async fn fail(&self, job: &Job, err: TaskError, retryable: bool) -> JobOutcome {
        let message = err.to_string();
        match self.queue.acknowledge_failed(job.id, err, retryable).await {
            Ok(AckOutcome::Requeued { available_at }) => {
                warn!(
                    job_id = %job.id,
                    queue = self.kind().queue_name(),
                    attempt = job.attempts,
                    error = %message,
                    available_at = ?available_at,
                    "job failed, retrying"
                );
                JobOutcome::Retried
            }
            Ok(AckOutcome::Failed(failure)) => {
                warn!(
                    job_id = %job.id,
                    queue = self.kind().queue_name(),
                    attempt = job.attempts,
                    error = %failure,
                    "job failed"
                );
                JobOutcome::Failed(failure)
            }
            Err(e) => self.abandon(job, e).await,
        }
    }

    async fn abandon(&self, job: &Job, err: QueueError) -> JobOutcome {
        match &err {
            QueueError::NotActive { state, .. } => {
                warn!(job_id = %job.id, state = ?state, "lease lost before acknowledgement");
            }
            _ => {
                error!(job_id = %job.id, error = %err, "failed to acknowledge job");
                self.report_error(Some(job), &err).await;
            }
        }
        JobOutcome::Abandoned(err)
    }

    async fn mark_busy(&self) {
        *self.busy.lock().await = true;
    }

    /// Emit `drained` once per busy → idle transition.
    async fn check_drained(&self) {
        let mut busy = self.busy.lock().await;
        if !*busy {
            return;
        }
        match self.queue.stats().await {
            Ok(stats) if stats.is_drained() => {
                *busy = false;
                self.emit(LifecycleEvent::drained(self.kind())).await;
            }
            Ok(_) => {}
            Err(e) => debug!(pool = %self.config.name, error = %e, "queue stats unavailable"),
        }
    }

    async fn report_error(&self, job: Option<&Job>, err: &QueueError) {
        let event = LifecycleEvent::error(self.kind(), job.map(|j| j.id), err.to_string());
        self.emit(event).await;
    }

    /// Best-effort publish; a lost worker event never fails the job.
    async fn emit(&self, event: LifecycleEvent) {
        if let Err(e) = self.queue.publish(event).await {
            debug!(pool = %self.config.name, error = %e, "failed to publish lifecycle event");
        }
    }

    async fn pause(&self, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => {}
            _ = shutdown.changed() => {}
        }
    }

    fn record(&self, outcome: &JobOutcome) {
        self.update_stats(|s| {
            s.current_running = s.current_running.saturating_sub(1);
            s.jobs_processed += 1;
            match outcome {
                JobOutcome::Completed => s.jobs_succeeded += 1,
                JobOutcome::Retried => s.jobs_retried += 1,
                JobOutcome::Failed(_) => s.jobs_failed += 1,
                JobOutcome::Abandoned(_) => {}
            }
        });
    }

    fn update_stats(&self, f: impl FnOnce(&mut PoolStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}

async fn log_lifecycle(
    pool: String,
    source: Arc<dyn JobQueue>,
    mut events: Subscription<LifecycleEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = shutdown.changed() => break,
        };
        let Some(event) = event else {
            warn!(pool = %pool, "lifecycle stream closed, resubscribing");
            tokio::select! {
                fresh = resubscribe(source.as_ref()) => events = fresh,
                _ = shutdown.changed() => break,
            }
            continue;
        };

        let queue = event.kind().queue_name();
        let job_id = event.job_id().map(|id| id.to_string()).unwrap_or_default();
        match event.event() {
            LifecycleEventKind::Started { attempt } => {
                debug!(pool = %pool, queue, job_id = %job_id, attempt, "job started");
            }
            LifecycleEventKind::Completed { .. } => {
                info!(pool = %pool, queue, job_id = %job_id, "job completed");
            }
            LifecycleEventKind::Failed { failure } => {
                warn!(pool = %pool, queue, job_id = %job_id, error = %failure, "job failed permanently");
            }
            LifecycleEventKind::Drained => {
                info!(pool = %pool, queue, "queue drained");
            }
            LifecycleEventKind::Error { message } => {
                error!(pool = %pool, queue, job_id = %job_id, error = %message, "worker error");
            }
        }
    }
}
