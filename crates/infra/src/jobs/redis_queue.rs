//! Redis-backed job queue (optional).
//!
//! ## Layout
//!
//! - `offload:{queue}:job:{id}`: JSON job record
//! - `offload:{queue}:waiting`: list of ready job ids (RPUSH / LPOP)
//! - `offload:{queue}:delayed`: sorted set of backed-off ids, scored by due time (ms)
//! - `offload:{queue}:active`: sorted set of leased ids, scored by lease deadline (ms)
//! - `offload:{queue}:completed` / `:failed`: terminal counters
//! - `offload:{queue}:events`: pub/sub channel for lifecycle events
//!
//! Every move of an id between `waiting`, `delayed` and `active` is one Lua
//! script, so an id is always in exactly one of them until it finishes. A
//! worker that dies mid-lease leaves its id in `active`, where the deadline
//! brings it back. Only the caller whose script removes an id from `active`
//! may record the job's next state.

use async_trait::async_trait;
use chrono::Utc;
use redis::Script;
use redis::aio::MultiplexedConnection;
use serde_json::Value as JsonValue;
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

use offload_core::{JobId, JobKind, TaskError};
use offload_events::{EventBus, LifecycleEvent, Subscription};

use super::queue::{JobQueue, QueueError, QueueOptions};
use super::types::{AckOutcome, Job, JobState, QueueStats, lease_deadline};
use crate::event_bus::RedisLifecycleBus;

/// KEYS: waiting, active. ARGV: lease deadline (ms).
const LEASE_SCRIPT: &str = r"
local id = redis.call('LPOP', KEYS[1])
if not id then
  return false
end
redis.call('ZADD', KEYS[2], ARGV[1], id)
return id
";

/// KEYS: delayed, waiting. ARGV: now (ms).
const PROMOTE_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('RPUSH', KEYS[2], id)
end
return #due
";

/// KEYS: active, job record, destination. ARGV: id, record, mode, score or ttl.
///
/// `waiting` pushes onto a list, `delayed` adds to a sorted set, `finished`
/// stores the record with a ttl and bumps a counter. Returns 0 when the id
/// was no longer active.
const COMMIT_SCRIPT: &str = r"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
if ARGV[3] == 'waiting' then
  redis.call('SET', KEYS[2], ARGV[2])
  redis.call('RPUSH', KEYS[3], ARGV[1])
elseif ARGV[3] == 'delayed' then
  redis.call('SET', KEYS[2], ARGV[2])
  redis.call('ZADD', KEYS[3], ARGV[4], ARGV[1])
else
  redis.call('SET', KEYS[2], ARGV[2], 'EX', ARGV[4])
  redis.call('INCR', KEYS[3])
end
return 1
";

/// Longest record ttl Redis is asked for.
const MAX_RETENTION_SECS: u64 = u32::MAX as u64;

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::BrokerUnavailable(err.to_string())
    }
}

#[derive(Debug)]
pub struct RedisJobQueue {
    kind: JobKind,
    options: QueueOptions,
    client: redis::Client,
    conn: OnceCell<MultiplexedConnection>,
    events: RedisLifecycleBus,
    lease_script: Script,
    promote_script: Script,
    commit_script: Script,
}

impl RedisJobQueue {
    pub fn new(client: redis::Client, kind: JobKind, options: QueueOptions) -> Self {
        let events = RedisLifecycleBus::new(client.clone(), format!("offload:{}:events", kind.queue_name()));
        Self {
            kind,
            options,
            client,
            conn: OnceCell::new(),
            events,
            lease_script: Script::new(LEASE_SCRIPT),
            promote_script: Script::new(PROMOTE_SCRIPT),
            commit_script: Script::new(COMMIT_SCRIPT),
        }
    }

    pub fn open(redis_url: impl AsRef<str>, kind: JobKind, options: QueueOptions) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())?;
        Ok(Self::new(client, kind, options))
    }

    fn key(&self, suffix: &str) -> String {
        format!("offload:{}:{}", self.kind.queue_name(), suffix)
    }

    fn job_key(&self, id: JobId) -> String {
        self.key(&format!("job:{id}"))
    }

    fn retention_secs(&self) -> u64 {
        self.options.retention.as_secs().clamp(1, MAX_RETENTION_SECS)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, QueueError> {
        let conn = self
            .conn
            .get_or_try_init(|| self.client.get_multiplexed_async_connection())
            .await?;
        Ok(conn.clone())
    }

    async fn load(&self, conn: &mut MultiplexedConnection, id: JobId) -> Result<Option<Job>, QueueError> {
        let raw: Option<String> = redis::cmd("GET").arg(self.job_key(id)).query_async(conn).await?;
        raw.map(|s| serde_json::from_str(&s).map_err(QueueError::from))
            .transpose()
    }

    async fn store(&self, conn: &mut MultiplexedConnection, job: &Job) -> Result<(), QueueError> {
        let json = serde_json::to_string(job)?;
        let _: () = redis::cmd("SET")
            .arg(self.job_key(job.id))
            .arg(json)
            .query_async(conn)
            .await?;
        Ok(())
    }

    /// Load an active job. The `active` set, not the record, decides whether
    /// the caller still holds the lease; that is settled by [`Self::commit`].
    async fn load_active(&self, conn: &mut MultiplexedConnection, id: JobId) -> Result<Job, QueueError> {
        let job = self.load(conn, id).await?.ok_or(QueueError::NotFound(id))?;
        if job.state != JobState::Active {
            return Err(QueueError::NotActive { id, state: job.state });
        }
        Ok(job)
    }

    /// Take `job` out of `active` and record its new state in one step.
    async fn commit(&self, conn: &mut MultiplexedConnection, job: &Job) -> Result<(), QueueError> {
        let record = serde_json::to_string(job)?;
        let mut invocation = self.commit_script.prepare_invoke();
        invocation.key(self.key("active")).key(self.job_key(job.id));

        match (job.state, job.available_at) {
            (JobState::Waiting, None) => {
                invocation.key(self.key("waiting")).arg(job.id.to_string()).arg(record).arg("waiting").arg(0);
            }
            (JobState::Waiting, Some(at)) => {
                invocation
                    .key(self.key("delayed"))
                    .arg(job.id.to_string())
                    .arg(record)
                    .arg("delayed")
                    .arg(at.timestamp_millis());
            }
            (JobState::Completed, _) | (JobState::Failed, _) => {
                let counter = if job.state == JobState::Completed { "completed" } else { "failed" };
                invocation
                    .key(self.key(counter))
                    .arg(job.id.to_string())
                    .arg(record)
                    .arg("finished")
                    .arg(self.retention_secs());
            }
            (JobState::Active, _) => {
                return Err(QueueError::NotActive {
                    id: job.id,
                    state: JobState::Active,
                });
            }
        }

        let moved: i64 = invocation.invoke_async(conn).await?;
        if moved == 0 {
            let state = self
                .load(conn, job.id)
                .await?
                .map(|j| j.state)
                .unwrap_or(job.state);
            return Err(QueueError::NotActive { id: job.id, state });
        }
        Ok(())
    }

    async fn broadcast(&self, event: LifecycleEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!(queue = self.kind.queue_name(), error = %e, "failed to publish lifecycle event");
        }
    }

    /// Move backed-off jobs whose delay passed onto the waiting list.
    async fn promote_due(&self, conn: &mut MultiplexedConnection, now_ms: i64) -> Result<(), QueueError> {
        let promoted: i64 = self
            .promote_script
            .key(self.key("delayed"))
            .key(self.key("waiting"))
            .arg(now_ms)
            .invoke_async(conn)
            .await?;
        if promoted > 0 {
            debug!(promoted, "delayed jobs promoted");
        }
        Ok(())
    }

    /// Redeliver or fail jobs whose lease deadline passed.
    async fn reclaim_expired(&self, conn: &mut MultiplexedConnection, now_ms: i64) -> Result<(), QueueError> {
        let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.key("active"))
            .arg("-inf")
            .arg(now_ms)
            .query_async(conn)
            .await?;

        for raw in expired {
            let Ok(id) = raw.parse::<JobId>() else {
                warn!(queue = self.kind.queue_name(), id = %raw, "dropping malformed active entry");
                let _: i64 = redis::cmd("ZREM").arg(self.key("active")).arg(&raw).query_async(conn).await?;
                continue;
            };
            let Some(mut job) = self.load(conn, id).await? else {
                warn!(job_id = %id, "active entry without a job record");
                let _: i64 = redis::cmd("ZREM").arg(self.key("active")).arg(&raw).query_async(conn).await?;
                continue;
            };

            let error = TaskError::transient("lease expired");
            let failure = match job.state {
                // leased, but the worker died before recording the attempt
                JobState::Waiting => None,
                JobState::Active if job.can_retry() => {
                    let delay = self.options.retry.delay_for_attempt(job.attempts);
                    job.mark_requeued(&error, delay)?;
                    None
                }
                JobState::Active => Some(job.mark_failed(error)?),
                JobState::Completed | JobState::Failed => {
                    let _: i64 = redis::cmd("ZREM").arg(self.key("active")).arg(&raw).query_async(conn).await?;
                    continue;
                }
            };

            match self.commit(conn, &job).await {
                Ok(()) => {}
                Err(QueueError::NotActive { .. }) => continue,
                Err(e) => return Err(e),
            }

            match failure {
                Some(failure) => {
                    warn!(job_id = %id, queue = self.kind.queue_name(), attempt = job.attempts, "lease expired, attempts exhausted");
                    self.broadcast(LifecycleEvent::failed(id, self.kind, failure)).await;
                }
                None => {
                    warn!(job_id = %id, queue = self.kind.queue_name(), attempt = job.attempts, "lease expired, job redelivered");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    fn kind(&self) -> JobKind {
        self.kind
    }

    #[instrument(skip(self, payload), fields(queue = self.kind.queue_name()), err)]
    async fn enqueue(&self, payload: JsonValue) -> Result<JobId, QueueError> {
        let job = Job::new(self.kind, payload, self.options.retry.max_attempts);
        let record = serde_json::to_string(&job)?;
        let mut conn = self.connection().await?;

        let _: () = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.job_key(job.id))
            .arg(record)
            .ignore()
            .cmd("RPUSH")
            .arg(self.key("waiting"))
            .arg(job.id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!(job_id = %job.id, "job enqueued");
        Ok(job.id)
    }

    #[instrument(skip(self), fields(queue = self.kind.queue_name()), err)]
    async fn lease(&self) -> Result<Option<Job>, QueueError> {
        let mut conn = self.connection().await?;
        let now = Utc::now();
        let now_ms = now.timestamp_millis();

        self.reclaim_expired(&mut conn, now_ms).await?;
        self.promote_due(&mut conn, now_ms).await?;

        let deadline = lease_deadline(now, self.options.lease_timeout);
        loop {
            let popped: Option<String> = self
                .lease_script
                .key(self.key("waiting"))
                .key(self.key("active"))
                .arg(deadline.timestamp_millis())
                .invoke_async(&mut conn)
                .await?;
            let Some(raw) = popped else {
                return Ok(None);
            };

            let Ok(id) = raw.parse::<JobId>() else {
                warn!(id = %raw, "dropping malformed waiting entry");
                let _: i64 = redis::cmd("ZREM").arg(self.key("active")).arg(&raw).query_async(&mut conn).await?;
                continue;
            };
            let Some(mut job) = self.load(&mut conn, id).await? else {
                warn!(job_id = %id, "waiting entry without a job record");
                let _: i64 = redis::cmd("ZREM").arg(self.key("active")).arg(&raw).query_async(&mut conn).await?;
                continue;
            };

            job.mark_active_until(deadline)?;
            self.store(&mut conn, &job).await?;

            debug!(job_id = %id, attempt = job.attempts, "job leased");
            return Ok(Some(job));
        }
    }

    #[instrument(skip(self, result), fields(queue = self.kind.queue_name()), err)]
    async fn acknowledge_complete(&self, job_id: JobId, result: JsonValue) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let mut job = self.load_active(&mut conn, job_id).await?;

        job.mark_completed(result.clone())?;
        self.commit(&mut conn, &job).await?;

        self.broadcast(LifecycleEvent::completed(job_id, self.kind, result))
            .await;
        Ok(())
    }

    #[instrument(skip(self, error), fields(queue = self.kind.queue_name()), err)]
    async fn acknowledge_failed(
        &self,
        job_id: JobId,
        error: TaskError,
        retryable: bool,
    ) -> Result<AckOutcome, QueueError> {
        let mut conn = self.connection().await?;
        let mut job = self.load_active(&mut conn, job_id).await?;

        if retryable && job.can_retry() {
            let delay = self.options.retry.delay_for_attempt(job.attempts);
            job.mark_requeued(&error, delay)?;
            self.commit(&mut conn, &job).await?;
            return Ok(AckOutcome::Requeued {
                available_at: job.available_at,
            });
        }

        let failure = job.mark_failed(error)?;
        self.commit(&mut conn, &job).await?;
        self.broadcast(LifecycleEvent::failed(job_id, self.kind, failure.clone()))
            .await;
        Ok(AckOutcome::Failed(failure))
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        let mut conn = self.connection().await?;
        self.load(&mut conn, job_id).await
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.connection().await?;
        let (waiting, delayed, active, completed, failed): (usize, usize, usize, Option<usize>, Option<usize>) =
            redis::pipe()
                .cmd("LLEN")
                .arg(self.key("waiting"))
                .cmd("ZCARD")
                .arg(self.key("delayed"))
                .cmd("ZCARD")
                .arg(self.key("active"))
                .cmd("GET")
                .arg(self.key("completed"))
                .cmd("GET")
                .arg(self.key("failed"))
                .query_async(&mut conn)
                .await?;

        Ok(QueueStats {
            waiting: waiting + delayed,
            active,
            completed: completed.unwrap_or(0),
            failed: failed.unwrap_or(0),
        })
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
