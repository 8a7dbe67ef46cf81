//! Backpressure-aware incremental import loop.
//!
//! One [`IncrementalImporter::run`] scans the upstream from the job's
//! `enqueued_max` watermark, sends fixed-size batches of commands, and stops
//! early once the unprocessed backlog exceeds `max_unprocessed`. The next run
//! picks up from the watermark.
//!
//! Per batch:
//!
//! 1. skip positions already marked sent (overlap after a crashed run)
//! 2. record the rest as pending in the item store
//! 3. first batch only: pre-publish `enqueued_max` so concurrent readers of
//!    the backlog see the in-flight batch
//! 4. send, then mark sent and commit `enqueued_max`
//!
//! The ceiling is also checked before every fetch, so a run that starts over
//! it sends nothing. Cancellation (shutdown or a lost lease) is honored
//! before each fetch and before each send. Once a batch is sent it is always
//! committed.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use registry_core::{Clock, ImportJobId, SystemClock};
use registry_messaging::CommandBus;
use registry_observability::ImportMetrics;

use super::items::ImportItemStore;
use super::source::{ImportError, ImportSource};
use crate::config::IncrementalImportConfig;
use crate::import_jobs::{ImportJobQueueStatus, ImportJobStatus, ImportJobTracker};

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The upstream had nothing more.
    Exhausted,
    /// The unprocessed backlog exceeded the ceiling.
    Backpressure,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRunSummary {
    pub stop: StopReason,
    /// Commands sent during this run.
    pub sent: u64,
    pub batches: u64,
    pub enqueued_max_at_start: u64,
    /// Watermarks as stored after the last commit of this run.
    pub status: ImportJobStatus,
    pub cleared_item_state: bool,
}

enum BatchOutcome {
    Committed { sent: u64, status: ImportJobStatus },
    Cancelled,
}

/// Collaborators of an importer.
#[derive(Clone)]
pub struct ImportDependencies {
    pub tracker: Arc<dyn ImportJobTracker>,
    pub items: Arc<dyn ImportItemStore>,
    pub bus: Arc<dyn CommandBus>,
}

pub struct IncrementalImporter<S> {
    job_id: ImportJobId,
    source: S,
    deps: ImportDependencies,
    clock: Arc<dyn Clock>,
    metrics: Arc<ImportMetrics>,
    batch_size: usize,
    max_unprocessed: u64,
}

impl<S> std::fmt::Debug for IncrementalImporter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncrementalImporter")
            .field("job_id", &self.job_id)
            .field("batch_size", &self.batch_size)
            .field("max_unprocessed", &self.max_unprocessed)
            .finish_non_exhaustive()
    }
}

impl<S: ImportSource> IncrementalImporter<S> {
    pub fn new(job_id: ImportJobId, source: S, deps: ImportDependencies, config: &IncrementalImportConfig) -> Self {
        Self {
            job_id,
            source,
            deps,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(ImportMetrics::new()),
            batch_size: config.batch_size.max(1),
            max_unprocessed: config.max_unprocessed,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<ImportMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn job_id(&self) -> &ImportJobId {
        &self.job_id
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn metrics(&self) -> &Arc<ImportMetrics> {
        &self.metrics
    }

    #[instrument(skip(self, cancel), fields(job_id = %self.job_id), err)]
    pub async fn run(&self, cancel: &CancellationToken) -> Result<ImportRunSummary, ImportError> {
        let job = &self.job_id;
        let start = self.deps.tracker.get_status(job).await?;
        let mut status = start;

        // Pending items left by an interrupted run sit at or below the
        // watermark; resume just before the first of them.
        let mut cursor = match self.deps.items.first_unsent(job).await? {
            Some(first) => start.enqueued_max().min(first.saturating_sub(1)),
            None => start.enqueued_max(),
        };
        if cursor < start.enqueued_max() {
            warn!(resume_after = cursor, enqueued_max = start.enqueued_max(), "resuming before unsent items");
        }

        let mut buffer: Vec<u64> = Vec::with_capacity(self.batch_size);
        let mut source_max: Option<u64> = None;
        let mut prepublished = false;
        let mut sent = 0u64;
        let mut batches = 0u64;

        let stop = 'scan: loop {
            if cancel.is_cancelled() {
                break 'scan StopReason::Cancelled;
            }
            if self.over_ceiling(&status) {
                break 'scan StopReason::Backpressure;
            }

            let page = self.source.fetch_page(cursor).await?;
            source_max = source_max.max(page.source_max);
            let exhausted = page.positions.is_empty();
            if let Some(&last) = page.positions.last() {
                cursor = last;
            }
            buffer.extend(page.positions);

            while buffer.len() >= self.batch_size || (exhausted && !buffer.is_empty()) {
                let take = buffer.len().min(self.batch_size);
                let batch: Vec<u64> = buffer.drain(..take).collect();

                match self
                    .enqueue_batch(&batch, source_max, &mut prepublished, cancel)
                    .await?
                {
                    BatchOutcome::Committed { sent: n, status: committed } => {
                        sent += n;
                        batches += 1;
                        status = committed;
                    }
                    BatchOutcome::Cancelled => break 'scan StopReason::Cancelled,
                }

                if self.over_ceiling(&status) {
                    break 'scan StopReason::Backpressure;
                }
            }

            if exhausted {
                break 'scan StopReason::Exhausted;
            }
        };

        let mut cleared_item_state = false;
        if stop == StopReason::Exhausted && sent == 0 {
            let latest = self.deps.tracker.get_status(job).await?;
            if latest.is_caught_up() && latest.enqueued_max() == start.enqueued_max() {
                let removed = self.deps.items.clear(job).await?;
                debug!(removed, "caught up; cleared item state");
                self.metrics.record_item_state_cleared();
                cleared_item_state = true;
            }
            status = latest;
        }

        match stop {
            StopReason::Backpressure => self.metrics.record_backpressure(),
            StopReason::Cancelled => self.metrics.record_cancelled(),
            StopReason::Exhausted => {}
        }

        info!(?stop, sent, batches, enqueued_max = status.enqueued_max(), "import run finished");
        Ok(ImportRunSummary {
            stop,
            sent,
            batches,
            enqueued_max_at_start: start.enqueued_max(),
            status,
            cleared_item_state,
        })
    }

    fn over_ceiling(&self, status: &ImportJobStatus) -> bool {
        let over = status.unprocessed() > self.max_unprocessed;
        if over {
            info!(
                unprocessed = status.unprocessed(),
                max_unprocessed = self.max_unprocessed,
                "backlog over ceiling; pausing import"
            );
        }
        over
    }

    async fn enqueue_batch(
        &self,
        batch: &[u64],
        source_max: Option<u64>,
        prepublished: &mut bool,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome, ImportError> {
        let job = &self.job_id;
        let Some(&batch_max) = batch.last() else {
            return Ok(BatchOutcome::Committed {
                sent: 0,
                status: self.deps.tracker.get_status(job).await?,
            });
        };
        let watermark = ImportJobQueueStatus::new(batch_max, source_max);

        let already_sent = self.deps.items.sent_among(job, batch).await?;
        let fresh: Vec<u64> = batch
            .iter()
            .copied()
            .filter(|p| !already_sent.contains(p))
            .collect();

        if fresh.is_empty() {
            let status = self.deps.tracker.track_queue_status(job, watermark).await?;
            return Ok(BatchOutcome::Committed { sent: 0, status });
        }

        self.deps.items.record_pending(job, &fresh).await?;

        if !*prepublished {
            self.deps.tracker.track_queue_status(job, watermark).await?;
            *prepublished = true;
        }

        if cancel.is_cancelled() {
            return Ok(BatchOutcome::Cancelled);
        }

        let now = self.clock.now();
        let commands = fresh
            .iter()
            .map(|&p| self.source.command_for(job, p, now))
            .collect::<Result<Vec<_>, _>>()?;
        self.deps.bus.send_batch(commands).await?;

        self.deps.items.mark_sent(job, &fresh).await?;
        let status = self.deps.tracker.track_queue_status(job, watermark).await?;

        let count = fresh.len() as u64;
        self.metrics.record_batch(count);
        debug!(count, enqueued_max = status.enqueued_max(), "batch committed");

        Ok(BatchOutcome::Committed { sent: count, status })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use registry_messaging::InMemoryCommandBus;

    use super::*;
    use crate::import::items::InMemoryImportItemStore;
    use crate::import_jobs::{ImportJobProcessingStatus, InMemoryImportJobTracker};
    use crate::test_support::RangeSource;

    struct Harness {
        job: ImportJobId,
        tracker: Arc<InMemoryImportJobTracker>,
        items: Arc<InMemoryImportItemStore>,
        bus: Arc<InMemoryCommandBus>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                job: ImportJobId::new("test-import").unwrap(),
                tracker: Arc::new(InMemoryImportJobTracker::new()),
                items: Arc::new(InMemoryImportItemStore::new()),
                bus: Arc::new(InMemoryCommandBus::new()),
            }
        }

        fn importer(&self, source: RangeSource, batch_size: usize, max_unprocessed: u64) -> IncrementalImporter<RangeSource> {
            let config = IncrementalImportConfig::default()
                .with_batch_size(batch_size)
                .with_max_unprocessed(max_unprocessed);
            let deps = ImportDependencies {
                tracker: self.tracker.clone(),
                items: self.items.clone(),
                bus: self.bus.clone(),
            };
            IncrementalImporter::new(self.job.clone(), source, deps, &config)
        }

        async fn process_up_to(&self, position: u64) {
            self.tracker
                .track_processed_status(&self.job, ImportJobProcessingStatus::new(position))
                .await
                .unwrap();
        }

        fn distinct_keys(&self) -> usize {
            self.bus
                .sent()
                .iter()
                .map(|c| c.idempotency_key().to_string())
                .collect::<HashSet<_>>()
                .len()
        }
    }

    #[tokio::test]
    async fn stops_one_batch_past_the_backlog_ceiling_and_resumes_without_duplicates() {
        let h = Harness::new();
        let importer = h.importer(RangeSource::new(120_000, 1_000), 100, 50_000);
        let cancel = CancellationToken::new();

        let first = importer.run(&cancel).await.unwrap();
        assert_eq!(first.stop, StopReason::Backpressure);
        assert_eq!(first.sent, 50_100);
        assert_eq!(first.status.enqueued_max(), 50_100);
        assert_eq!(first.status.source_max(), Some(120_000));

        // No progress from consumers: nothing more goes out.
        let stalled = importer.run(&cancel).await.unwrap();
        assert_eq!(stalled.stop, StopReason::Backpressure);
        assert_eq!(stalled.sent, 0);
        assert_eq!(h.bus.sent_count(), 50_100);

        h.process_up_to(50_100).await;
        let second = importer.run(&cancel).await.unwrap();
        assert_eq!(second.stop, StopReason::Backpressure);
        assert_eq!(second.enqueued_max_at_start, 50_100);
        assert_eq!(second.status.enqueued_max(), 100_200);

        h.process_up_to(100_200).await;
        let third = importer.run(&cancel).await.unwrap();
        assert_eq!(third.stop, StopReason::Exhausted);
        assert_eq!(third.status.enqueued_max(), 120_000);

        assert_eq!(h.bus.sent_count(), 120_000);
        assert_eq!(h.distinct_keys(), 120_000);
        assert_eq!(importer.metrics().snapshot().backpressure_stops, 3);
    }

    #[tokio::test]
    async fn run_starting_over_the_ceiling_does_not_touch_the_source() {
        let h = Harness::new();
        let importer = h.importer(RangeSource::new(1_000, 100), 100, 150);
        let cancel = CancellationToken::new();

        importer.run(&cancel).await.unwrap();
        let fetches = importer.source().fetches();
        let summary = importer.run(&cancel).await.unwrap();

        assert_eq!(summary.stop, StopReason::Backpressure);
        assert_eq!(summary.enqueued_max_at_start, 200);
        assert_eq!(summary.batches, 0);
        assert_eq!(importer.source().fetches(), fetches);
    }

    #[tokio::test]
    async fn partial_last_batch_is_flushed_when_the_source_runs_dry() {
        let h = Harness::new();
        let importer = h.importer(RangeSource::new(250, 1_000), 100, 10_000);

        let summary = importer.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(summary.stop, StopReason::Exhausted);
        assert_eq!(summary.sent, 250);
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.status.enqueued_max(), 250);
    }

    #[tokio::test]
    async fn cancelled_run_sends_nothing() {
        let h = Harness::new();
        let importer = h.importer(RangeSource::new(500, 100), 100, 10_000);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = importer.run(&cancel).await.unwrap();

        assert_eq!(summary.stop, StopReason::Cancelled);
        assert_eq!(summary.sent, 0);
        assert_eq!(h.bus.sent_count(), 0);
        assert_eq!(importer.source().fetches(), 0);
        assert_eq!(importer.metrics().snapshot().cancelled_runs, 1);
    }

    #[tokio::test]
    async fn failed_send_is_retried_on_the_next_run() {
        let h = Harness::new();
        let source = RangeSource::new(100, 1_000);
        let importer = h.importer(source, 100, 10_000);
        let cancel = CancellationToken::new();

        importer.run(&cancel).await.unwrap();
        importer.source().grow_to(250);

        // Batch 101..=200 is recorded and pre-published, then the send fails.
        h.bus.fail_next_sends(1);
        let err = importer.run(&cancel).await.unwrap_err();
        assert!(matches!(err, ImportError::Bus(_)));
        let status = h.tracker.get_status(&h.job).await.unwrap();
        assert_eq!(status.enqueued_max(), 200);
        assert_eq!(h.items.first_unsent(&h.job).await.unwrap(), Some(101));

        let summary = importer.run(&cancel).await.unwrap();
        assert_eq!(summary.stop, StopReason::Exhausted);
        assert_eq!(summary.sent, 150);
        assert_eq!(summary.status.enqueued_max(), 250);
        assert_eq!(h.bus.sent_count(), 250);
        assert_eq!(h.distinct_keys(), 250);
        assert_eq!(h.items.first_unsent(&h.job).await.unwrap(), None);
    }

    #[tokio::test]
    async fn positions_already_sent_are_skipped_on_resume() {
        let h = Harness::new();
        // Leftovers of an interrupted run: 6..=10 went out, 1..=5 did not.
        let all: Vec<u64> = (1..=10).collect();
        h.items.record_pending(&h.job, &all).await.unwrap();
        h.items.mark_sent(&h.job, &all[5..]).await.unwrap();
        h.tracker
            .track_queue_status(&h.job, ImportJobQueueStatus::new(10, None))
            .await
            .unwrap();

        let importer = h.importer(RangeSource::new(10, 100), 100, 10_000);
        let summary = importer.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(summary.sent, 5);
        let keys: Vec<String> = h.bus.sent().iter().map(|c| c.idempotency_key().to_string()).collect();
        let expected: Vec<String> = (1..=5).map(|p| format!("test-import:{p}")).collect();
        assert_eq!(keys, expected);
    }

    #[tokio::test]
    async fn item_state_is_cleared_once_caught_up() {
        let h = Harness::new();
        let importer = h.importer(RangeSource::new(300, 100), 100, 10_000);
        let cancel = CancellationToken::new();

        let first = importer.run(&cancel).await.unwrap();
        assert!(!first.cleared_item_state);
        assert_eq!(h.items.len(&h.job), 300);

        // Exhausted but consumers are behind: keep the state.
        let behind = importer.run(&cancel).await.unwrap();
        assert!(!behind.cleared_item_state);
        assert_eq!(h.items.len(&h.job), 300);

        h.process_up_to(300).await;
        let caught_up = importer.run(&cancel).await.unwrap();
        assert!(caught_up.cleared_item_state);
        assert_eq!(h.items.len(&h.job), 0);
        assert_eq!(h.bus.sent_count(), 300);
    }
}
