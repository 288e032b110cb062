//! Tracing and logging (shared setup).

/// Initialize process-wide logging from the environment.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Log output settings.
pub mod logging;

/// Subscriber installation.
pub mod tracing;

pub use logging::{LogConfig, LogConfigError, LogFormat};
