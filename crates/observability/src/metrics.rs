//! Counters are plain atomics owned by whoever constructs the scheduler or
//! importer and passed in explicitly; there is no global registry.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-scheduler run counters.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    ticks: AtomicU64,
    runs_succeeded: AtomicU64,
    runs_failed: AtomicU64,
    skipped_disabled: AtomicU64,
    skipped_lease_held: AtomicU64,
    skipped_should_run: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerMetricsSnapshot {
    pub ticks: u64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub skipped_disabled: u64,
    pub skipped_lease_held: u64,
    pub skipped_should_run: u64,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.runs_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.runs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped_disabled(&self) {
        self.skipped_disabled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped_lease_held(&self) {
        self.skipped_lease_held.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped_should_run(&self) {
        self.skipped_should_run.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SchedulerMetricsSnapshot {
        SchedulerMetricsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            runs_succeeded: self.runs_succeeded.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            skipped_disabled: self.skipped_disabled.load(Ordering::Relaxed),
            skipped_lease_held: self.skipped_lease_held.load(Ordering::Relaxed),
            skipped_should_run: self.skipped_should_run.load(Ordering::Relaxed),
        }
    }
}

/// Per-importer counters.
#[derive(Debug, Default)]
pub struct ImportMetrics {
    items_enqueued: AtomicU64,
    batches_sent: AtomicU64,
    backpressure_stops: AtomicU64,
    cancelled_runs: AtomicU64,
    item_state_clears: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportMetricsSnapshot {
    pub items_enqueued: u64,
    pub batches_sent: u64,
    pub backpressure_stops: u64,
    pub cancelled_runs: u64,
    pub item_state_clears: u64,
}

impl ImportMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_batch(&self, items: u64) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.items_enqueued.fetch_add(items, Ordering::Relaxed);
    }

    pub fn record_backpressure(&self) {
        self.backpressure_stops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_item_state_cleared(&self) {
        self.item_state_clears.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ImportMetricsSnapshot {
        ImportMetricsSnapshot {
            items_enqueued: self.items_enqueued.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            backpressure_stops: self.backpressure_stops.load(Ordering::Relaxed),
            cancelled_runs: self.cancelled_runs.load(Ordering::Relaxed),
            item_state_clears: self.item_state_clears.load(Ordering::Relaxed),
        }
    }
}
