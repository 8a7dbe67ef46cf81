//! Tracing, logging, metrics (shared setup).

/// Initialize process-wide tracing with the default configuration.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    self::tracing::init();
}

/// Tracing configuration (filters, output format).
pub mod tracing;

/// In-process counters for the scheduler and import jobs.
pub mod metrics;

pub use metrics::{ImportMetrics, ImportMetricsSnapshot, SchedulerMetrics, SchedulerMetricsSnapshot};
pub use self::tracing::{LogFormat, TracingConfig, UnknownLogFormat, init_with};
