//! Tracing and logging (shared setup).

/// Initialize process-wide observability (tracing/logging) from the environment.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init_with(&ObservabilityConfig::from_env_or_default());
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Observability settings.
pub mod config;

pub use config::{LogFormat, ObservabilityConfig, ObservabilityConfigError};
pub use tracing::init_with;
