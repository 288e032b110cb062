//! Wiring: one queue, one worker pool and one completion bridge per job kind.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::info;

use offload_core::JobKind;
use offload_tasks::{
    BlobStore, DeleteFileTask, JobHandler, Mailer, SendEmailTask, UploadFileTask, handler,
};

use crate::config::{ConfigError, OffloadConfig};
use crate::jobs::{
    InMemoryJobQueue, JobClient, JobQueue, PoolStats, QueueError, SubmitError, WorkerError, WorkerPool,
    WorkerPoolHandle,
};

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("more than one handler registered for {0}")]
    DuplicateHandler(JobKind),
}

/// A running job system.
///
/// ```ignore
/// let handlers = JobSystem::default_handlers(mailer, blob_store);
/// let system = JobSystem::in_memory(OffloadConfig::from_env()?, handlers).await?;
///
/// let receipt = system.client().call::<UploadFileTask>(&payload, timeout).await?;
/// system.shutdown().await;
/// ```
pub struct JobSystem {
    config: OffloadConfig,
    queues: HashMap<JobKind, Arc<dyn JobQueue>>,
    pools: HashMap<JobKind, WorkerPoolHandle>,
    client: JobClient,
}

impl JobSystem {
    /// Handlers for every built-in job kind.
    pub fn default_handlers(mailer: Arc<dyn Mailer>, blob_store: Arc<dyn BlobStore>) -> Vec<Arc<dyn JobHandler>> {
        vec![
            handler(SendEmailTask::new(mailer)),
            handler(UploadFileTask::new(blob_store.clone())),
            handler(DeleteFileTask::new(blob_store)),
        ]
    }

    /// Start with in-memory queues.
    pub async fn in_memory(config: OffloadConfig, handlers: Vec<Arc<dyn JobHandler>>) -> Result<Self, SystemError> {
        let routes = handlers
            .into_iter()
            .map(|h| {
                let kind = h.kind();
                let queue: Arc<dyn JobQueue> =
                    Arc::new(InMemoryJobQueue::with_options(kind, config.queue_options(kind)));
                (queue, h)
            })
            .collect();
        Self::start(config, routes).await
    }

    /// Start with Redis queues at `config.redis_url`.
    #[cfg(feature = "redis")]
    pub async fn redis(config: OffloadConfig, handlers: Vec<Arc<dyn JobHandler>>) -> Result<Self, SystemError> {
        use crate::jobs::RedisJobQueue;

        let url = config.redis_url.clone().ok_or_else(|| ConfigError::Invalid {
            key: "OFFLOAD_REDIS_URL".to_string(),
            value: String::new(),
            reason: "required for the redis broker".to_string(),
        })?;
        let client = redis::Client::open(url.as_str()).map_err(QueueError::from)?;

        let routes = handlers
            .into_iter()
            .map(|h| {
                let kind = h.kind();
                let queue: Arc<dyn JobQueue> =
                    Arc::new(RedisJobQueue::new(client.clone(), kind, config.queue_options(kind)));
                (queue, h)
            })
            .collect();
        Self::start(config, routes).await
    }

    /// Start a pool and a bridge for each `(queue, handler)` route.
    pub async fn start(
        config: OffloadConfig,
        routes: Vec<(Arc<dyn JobQueue>, Arc<dyn JobHandler>)>,
    ) -> Result<Self, SystemError> {
        let mut queues = HashMap::new();
        let mut pending = Vec::with_capacity(routes.len());
        let mut client = JobClient::new();

        for (queue, handler) in routes {
            let kind = queue.kind();
            if queues.insert(kind, queue.clone()).is_some() {
                return Err(SystemError::DuplicateHandler(kind));
            }
            let pool = WorkerPool::new(queue.clone(), handler, config.pool_config(kind))?;
            client.register(queue).await?;
            pending.push(pool);
        }

        let mut pools = HashMap::new();
        for pool in pending {
            pools.insert(pool.kind(), pool.spawn().await);
        }

        info!(queues = queues.len(), "job system started");
        Ok(Self {
            config,
            queues,
            pools,
            client,
        })
    }

    pub fn config(&self) -> &OffloadConfig {
        &self.config
    }

    pub fn client(&self) -> &JobClient {
        &self.client
    }

    pub fn queue(&self, kind: JobKind) -> Option<&Arc<dyn JobQueue>> {
        self.queues.get(&kind)
    }

    pub fn pool_stats(&self, kind: JobKind) -> Option<PoolStats> {
        self.pools.get(&kind).map(WorkerPoolHandle::stats)
    }

    /// [`JobClient::submit_and_wait`] with the configured await timeout.
    pub async fn submit_and_wait(&self, kind: JobKind, payload: JsonValue) -> Result<JsonValue, SubmitError> {
        self.client
            .submit_and_wait(kind, payload, self.config.await_timeout)
            .await
    }

    /// Stop every pool after its in-flight jobs finish.
    pub async fn shutdown(self) {
        for (_, pool) in self.pools {
            pool.shutdown().await;
        }
        info!("job system stopped");
    }
}
