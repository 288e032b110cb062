//! Completion bridge: turn a broadcast lifecycle stream into one awaited
//! outcome per caller.
//!
//! ```text
//! caller ──wait(id)──▶ Registry{id → [oneshot]} ◀──settle── dispatcher ◀── queue events
//! ```
//!
//! One dispatcher task per queue owns the subscription. Callers register a
//! one-shot slot, then look the job up in the queue, so a job that finished
//! before registration still resolves. A slot is removed on resolution, on
//! timeout, or when the waiting future is dropped.
//!
//! When the stream ends, the waiters pending at that moment fail with
//! `BrokerUnavailable` and the dispatcher resubscribes. Waiters registered
//! while it is reconnecting are settled from queue state once it is back.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use offload_core::{FailureReason, JobId, JobKind, TaskError};
use offload_events::{LifecycleEvent, LifecycleEventKind, Subscription};

use super::queue::{JobQueue, QueueError, resubscribe};
use super::types::{Job, JobState};

/// How many settled job ids are remembered for duplicate detection.
const SETTLED_LOG_CAPACITY: usize = 1024;

/// Error returned to a caller awaiting a job.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Broker(#[from] QueueError),
    #[error("job failed: {0}")]
    Failed(FailureReason),
    #[error("timed out after {waited:?} waiting for job {job_id}")]
    AwaitTimeout { job_id: JobId, waited: Duration },
    #[error("no queue registered for {0}")]
    UnknownQueue(JobKind),
    #[error("cannot decode job result: {0}")]
    Decode(String),
}

type Settlement = Result<JsonValue, SubmitError>;

#[derive(Default)]
struct RegistryState {
    waiters: HashMap<JobId, Vec<(u64, oneshot::Sender<Settlement>)>>,
    next_token: u64,
    settled: HashSet<JobId>,
    settled_order: VecDeque<JobId>,
}

#[derive(Default)]
struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    fn register(&self, job_id: JobId) -> Result<(u64, oneshot::Receiver<Settlement>), SubmitError> {
        let mut state = self.state.lock().map_err(|_| bridge_unavailable("registry poisoned"))?;
        let (tx, rx) = oneshot::channel();
        let token = state.next_token;
        state.next_token += 1;
        state.waiters.entry(job_id).or_default().push((token, tx));
        Ok((token, rx))
    }

    fn unregister(&self, job_id: JobId, token: u64) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if let Some(slots) = state.waiters.get_mut(&job_id) {
            slots.retain(|(t, _)| *t != token);
            if slots.is_empty() {
                state.waiters.remove(&job_id);
            }
        }
    }

    /// Resolve every waiter on `job_id`. Returns how many were resolved.
    fn resolve(&self, job_id: JobId, settlement: Settlement) -> usize {
        let slots = match self.state.lock() {
            Ok(mut state) => state.waiters.remove(&job_id).unwrap_or_default(),
            Err(_) => return 0,
        };
        let count = slots.len();
        for (_, tx) in slots {
            let _ = tx.send(settlement.clone());
        }
        count
    }

    /// Route one lifecycle event. Non-terminal events are ignored.
    fn settle(&self, event: LifecycleEvent) {
        let Some(job_id) = event.job_id() else {
            return;
        };
        let settlement = match event.into_event() {
            LifecycleEventKind::Completed { result } => Ok(result),
            LifecycleEventKind::Failed { failure } => Err(SubmitError::Failed(failure)),
            _ => return,
        };

        {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if !state.settled.insert(job_id) {
                warn!(job_id = %job_id, "duplicate terminal event ignored");
                return;
            }
            state.settled_order.push_back(job_id);
            while state.settled_order.len() > SETTLED_LOG_CAPACITY {
                match state.settled_order.pop_front() {
                    Some(oldest) => state.settled.remove(&oldest),
                    None => break,
                };
            }
        }

        let resolved = self.resolve(job_id, settlement);
        if resolved > 0 {
            debug!(job_id = %job_id, waiters = resolved, "job outcome delivered");
        }
    }

    /// Fail every waiter registered so far. Returns how many were failed.
    fn fail_pending(&self) -> usize {
        let slots: Vec<_> = match self.state.lock() {
            Ok(mut state) => state.waiters.drain().flat_map(|(_, slots)| slots).collect(),
            Err(_) => return 0,
        };
        let count = slots.len();
        for (_, tx) in slots {
            let _ = tx.send(Err(bridge_unavailable("lifecycle stream closed")));
        }
        count
    }

    fn pending_ids(&self) -> Vec<JobId> {
        self.state
            .lock()
            .map(|s| s.waiters.keys().copied().collect())
            .unwrap_or_default()
    }

    fn pending_count(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.waiters.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

fn bridge_unavailable(reason: &str) -> SubmitError {
    SubmitError::Broker(QueueError::BrokerUnavailable(reason.to_string()))
}

/// Removes a waiter's slot when the waiting future finishes or is dropped.
struct Registration<'a> {
    registry: &'a Registry,
    job_id: JobId,
    token: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.unregister(self.job_id, self.token);
    }
}

/// Correlates one queue's lifecycle events with callers awaiting specific jobs.
pub struct CompletionBridge {
    queue: Arc<dyn JobQueue>,
    registry: Arc<Registry>,
    dispatcher: JoinHandle<()>,
}

impl CompletionBridge {
    /// Subscribe to `queue`'s lifecycle stream and start the dispatcher.
    pub async fn start(queue: Arc<dyn JobQueue>) -> Result<Self, QueueError> {
        let events = queue.subscribe().await?;
        let registry = Arc::new(Registry::default());
        let dispatcher = tokio::spawn(dispatch(queue.clone(), registry.clone(), events));

        Ok(Self {
            queue,
            registry,
            dispatcher,
        })
    }

    pub fn kind(&self) -> JobKind {
        self.queue.kind()
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Enqueue `payload` and wait up to `timeout` for its outcome.
    ///
    /// A timeout cancels only the wait; the job keeps running.
    pub async fn submit_and_wait(&self, payload: JsonValue, timeout: Duration) -> Result<JsonValue, SubmitError> {
        let job_id = self.queue.enqueue(payload).await?;
        self.wait(job_id, timeout).await
    }

    /// Wait up to `timeout` for an already-enqueued job.
    pub async fn wait(&self, job_id: JobId, timeout: Duration) -> Result<JsonValue, SubmitError> {
        let (token, rx) = self.registry.register(job_id)?;
        let _registration = Registration {
            registry: &self.registry,
            job_id,
            token,
        };

        match self.queue.get(job_id).await? {
            Some(job) if job.state.is_terminal() => return settlement_of(job),
            Some(_) => {}
            None => return Err(SubmitError::Broker(QueueError::NotFound(job_id))),
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(settlement)) => settlement,
            Ok(Err(_)) => Err(bridge_unavailable("completion bridge stopped")),
            Err(_) => Err(SubmitError::AwaitTimeout {
                job_id,
                waited: timeout,
            }),
        }
    }

    /// Registered waiters not yet resolved.
    pub fn pending_count(&self) -> usize {
        self.registry.pending_count()
    }
}

impl Drop for CompletionBridge {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

fn settlement_of(job: Job) -> Settlement {
    match job.state {
        JobState::Completed => Ok(job.result.unwrap_or(JsonValue::Null)),
        _ => Err(SubmitError::Failed(job.failure.unwrap_or_else(|| {
            TaskError::permanent("job failed without a recorded reason").into_failure(job.attempts)
        }))),
    }
}

async fn dispatch(queue: Arc<dyn JobQueue>, registry: Arc<Registry>, mut events: Subscription<LifecycleEvent>) {
    let name = queue.kind().queue_name();
    loop {
        while let Some(event) = events.recv().await {
            registry.settle(event);
        }

        let failed = registry.fail_pending();
        warn!(queue = name, waiters = failed, "lifecycle stream closed, failing pending waiters");

        events = resubscribe(queue.as_ref()).await;
        reconcile(queue.as_ref(), &registry).await;
    }
}

/// Settle waiters whose job finished while no stream was attached.
async fn reconcile(queue: &dyn JobQueue, registry: &Registry) {
    for job_id in registry.pending_ids() {
        match queue.get(job_id).await {
            Ok(Some(job)) if job.state.is_terminal() => {
                registry.resolve(job_id, settlement_of(job));
            }
            Ok(_) => {}
            Err(e) => {
                warn!(queue = queue.kind().queue_name(), job_id = %job_id, error = %e, "cannot reconcile waiter");
            }
        }
    }
}
