//! Configuration loading and representation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use offload_core::JobKind;

use crate::jobs::{BackoffStrategy, QueueOptions, RetryPolicy, WorkerPoolConfig};

const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Longest duration any setting accepts.
const MAX_DURATION: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Delivery settings for one job kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Executions per job, first attempt included
    pub max_attempts: u32,
    /// Concurrent workers for this queue
    pub concurrency: usize,
    /// Base delay before a retried job becomes ready again
    pub backoff: Duration,
    pub backoff_strategy: BackoffStrategy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            concurrency: 1,
            backoff: Duration::ZERO,
            backoff_strategy: BackoffStrategy::Fixed,
        }
    }
}

impl QueueSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: self.backoff,
            max_delay: RetryPolicy::default().max_delay.max(self.backoff),
            strategy: self.backoff_strategy,
        }
    }
}

/// Runtime configuration for the job system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadConfig {
    /// Broker URL; `None` runs the in-memory broker
    pub redis_url: Option<String>,
    pub lease_timeout: Duration,
    pub poll_interval: Duration,
    /// Default wait for `submit_and_wait` callers
    pub await_timeout: Duration,
    pub handler_timeout: Option<Duration>,
    /// How long finished jobs stay readable before they are removed
    pub retention: Duration,
    pub email: QueueSettings,
    pub upload: QueueSettings,
    pub delete: QueueSettings,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            lease_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            await_timeout: Duration::from_secs(30),
            handler_timeout: None,
            retention: DEFAULT_RETENTION,
            email: QueueSettings::default(),
            upload: QueueSettings::default(),
            delete: QueueSettings::default(),
        }
    }
}

impl OffloadConfig {
    /// Load from `OFFLOAD_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key → value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.redis_url = lookup("OFFLOAD_REDIS_URL")
            .or_else(|| lookup("REDIS_URL"))
            .filter(|url| !url.trim().is_empty());
        if let Some(ms) = millis(&lookup, "OFFLOAD_LEASE_TIMEOUT_MS")? {
            config.lease_timeout = ms;
        }
        if let Some(ms) = millis(&lookup, "OFFLOAD_POLL_INTERVAL_MS")? {
            config.poll_interval = ms;
        }
        if let Some(ms) = millis(&lookup, "OFFLOAD_AWAIT_TIMEOUT_MS")? {
            config.await_timeout = ms;
        }
        config.handler_timeout = millis(&lookup, "OFFLOAD_HANDLER_TIMEOUT_MS")?.filter(|d| !d.is_zero());
        if let Some(ms) = millis(&lookup, "OFFLOAD_RETENTION_MS")? {
            config.retention = ms;
        }

        for kind in JobKind::ALL {
            let prefix = format!("OFFLOAD_{}", kind.queue_name().to_uppercase());
            let settings = config.queue_mut(kind);

            if let Some(n) = number::<u32>(&lookup, &format!("{prefix}_MAX_ATTEMPTS"))? {
                settings.max_attempts = n;
            }
            if let Some(n) = number::<usize>(&lookup, &format!("{prefix}_CONCURRENCY"))? {
                settings.concurrency = n;
            }
            if let Some(ms) = millis(&lookup, &format!("{prefix}_BACKOFF_MS"))? {
                settings.backoff = ms;
            }
            if let Some(raw) = lookup(&format!("{prefix}_BACKOFF_STRATEGY")) {
                settings.backoff_strategy = strategy(&format!("{prefix}_BACKOFF_STRATEGY"), &raw)?;
            }
        }

        Ok(config)
    }

    pub fn queue(&self, kind: JobKind) -> &QueueSettings {
        match kind {
            JobKind::SendEmail => &self.email,
            JobKind::UploadFile => &self.upload,
            JobKind::DeleteFile => &self.delete,
        }
    }

    fn queue_mut(&mut self, kind: JobKind) -> &mut QueueSettings {
        match kind {
            JobKind::SendEmail => &mut self.email,
            JobKind::UploadFile => &mut self.upload,
            JobKind::DeleteFile => &mut self.delete,
        }
    }

    pub fn queue_options(&self, kind: JobKind) -> QueueOptions {
        QueueOptions::default()
            .with_retry(self.queue(kind).retry_policy())
            .with_lease_timeout(self.lease_timeout)
            .with_retention(self.retention)
    }

    pub fn pool_config(&self, kind: JobKind) -> WorkerPoolConfig {
        let mut config = WorkerPoolConfig::default()
            .with_name(format!("{}-workers", kind.queue_name()))
            .with_concurrency(self.queue(kind).concurrency)
            .with_poll_interval(self.poll_interval);
        config.handler_timeout = self.handler_timeout;
        config
    }
}

fn invalid(key: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn number<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr + PartialOrd + From<u8>,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let value: T = raw.trim().parse().map_err(|e: T::Err| invalid(key, &raw, e.to_string()))?;
    if value < T::from(1) {
        return Err(invalid(key, &raw, "must be at least 1"));
    }
    Ok(Some(value))
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let ms = raw.trim().parse::<u64>().map_err(|e| invalid(key, &raw, e.to_string()))?;
    let duration = Duration::from_millis(ms);
    if duration > MAX_DURATION {
        return Err(invalid(key, &raw, "must be at most 100 years"));
    }
    Ok(Some(duration))
}

fn strategy(key: &str, raw: &str) -> Result<BackoffStrategy, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "fixed" => Ok(BackoffStrategy::Fixed),
        "linear" => Ok(BackoffStrategy::Linear),
        "exponential" => Ok(BackoffStrategy::Exponential),
        _ => Err(invalid(key, raw, "expected fixed, linear or exponential")),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<OffloadConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OffloadConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = load(&[]).unwrap();
        assert_eq!(config, OffloadConfig::default());
        assert_eq!(config.upload.max_attempts, 3);
        assert_eq!(config.retention, Duration::from_secs(24 * 60 * 60));
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn reads_per_queue_settings() {
        let config = load(&[
            ("OFFLOAD_UPLOAD_MAX_ATTEMPTS", "5"),
            ("OFFLOAD_EMAIL_CONCURRENCY", "4"),
            ("OFFLOAD_DELETE_BACKOFF_MS", "250"),
            ("OFFLOAD_DELETE_BACKOFF_STRATEGY", "Exponential"),
            ("OFFLOAD_LEASE_TIMEOUT_MS", "1000"),
            ("OFFLOAD_RETENTION_MS", "60000"),
        ])
        .unwrap();

        assert_eq!(config.upload.max_attempts, 5);
        assert_eq!(config.email.concurrency, 4);
        assert_eq!(config.delete.backoff, Duration::from_millis(250));

        let options = config.queue_options(JobKind::DeleteFile);
        assert_eq!(options.lease_timeout, Duration::from_secs(1));
        assert_eq!(options.retention, Duration::from_secs(60));
        assert_eq!(options.retry.strategy, BackoffStrategy::Exponential);
        assert_eq!(options.retry.delay_for_attempt(2), Duration::from_millis(500));

        let pool = config.pool_config(JobKind::SendEmail);
        assert_eq!(pool.concurrency, 4);
        assert_eq!(pool.name, "email-workers");
    }

    #[test]
    fn redis_url_falls_back_to_generic_variable() {
        let config = load(&[("REDIS_URL", "redis://cache:6379")]).unwrap();
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));

        let config = load(&[
            ("REDIS_URL", "redis://cache:6379"),
            ("OFFLOAD_REDIS_URL", "redis://jobs:6379"),
        ])
        .unwrap();
        assert_eq!(config.redis_url.as_deref(), Some("redis://jobs:6379"));
    }

    #[test]
    fn rejects_invalid_values() {
        let err = load(&[("OFFLOAD_UPLOAD_MAX_ATTEMPTS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "OFFLOAD_UPLOAD_MAX_ATTEMPTS"));

        assert!(load(&[("OFFLOAD_POLL_INTERVAL_MS", "soon")]).is_err());
        assert!(load(&[("OFFLOAD_LEASE_TIMEOUT_MS", "18446744073709551615")]).is_err());
        assert!(load(&[("OFFLOAD_UPLOAD_BACKOFF_MS", "10000000000000000")]).is_err());
        assert!(load(&[("OFFLOAD_EMAIL_BACKOFF_STRATEGY", "random")]).is_err());
    }

    #[test]
    fn deserializes_partial_documents() {
        let config: OffloadConfig = serde_json::from_value(serde_json::json!({
            "upload": {"max_attempts": 2}
        }))
        .unwrap();
        assert_eq!(config.upload.max_attempts, 2);
        assert_eq!(config.upload.concurrency, 1);
        assert_eq!(config.lease_timeout, Duration::from_secs(30));
    }
}
