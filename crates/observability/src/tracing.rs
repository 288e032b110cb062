//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

use crate::logging::{LogConfig, LogFormat};

/// Initialize tracing/logging for the process from the environment.
///
/// An unreadable `OFFLOAD_LOG_FORMAT` falls back to JSON.
pub fn init() {
    let config = LogConfig::from_env().unwrap_or_else(|_| LogConfig {
        filter: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        ..LogConfig::default()
    });
    init_with(&config);
}

/// Install the process-wide subscriber. Returns `false` if one was already set.
pub fn init_with(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = match config.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(config.with_target)
            .try_init()
            .is_ok(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(config.with_target)
            .try_init()
            .is_ok(),
    };

    if installed {
        ::tracing::debug!(filter = %config.filter, format = ?config.format, "logging initialized");
    }
    installed
}
