//! In-memory import job tracker for tests/dev.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use registry_core::ImportJobId;

use super::tracker::{ImportJobTracker, ImportJobTrackerError};
use super::types::{ImportJobProcessingStatus, ImportJobQueueStatus, ImportJobStatus};

#[derive(Debug, Default)]
pub struct InMemoryImportJobTracker {
    jobs: RwLock<HashMap<ImportJobId, ImportJobStatus>>,
}

impl InMemoryImportJobTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> ImportJobTrackerError {
    ImportJobTrackerError::Storage("tracker lock poisoned".to_string())
}

#[async_trait]
impl ImportJobTracker for InMemoryImportJobTracker {
    async fn get_status(&self, job_id: &ImportJobId) -> Result<ImportJobStatus, ImportJobTrackerError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs.get(job_id).copied().unwrap_or_default())
    }

    async fn track_queue_status(
        &self,
        job_id: &ImportJobId,
        status: ImportJobQueueStatus,
    ) -> Result<ImportJobStatus, ImportJobTrackerError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let entry = jobs.entry(job_id.clone()).or_default();
        entry.queue = entry.queue.merge(status);
        Ok(*entry)
    }

    async fn track_processed_status(
        &self,
        job_id: &ImportJobId,
        status: ImportJobProcessingStatus,
    ) -> Result<ImportJobStatus, ImportJobTrackerError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let current = jobs.get(job_id).copied().unwrap_or_default();

        if status.processed_max > current.queue.enqueued_max {
            return Err(ImportJobTrackerError::ProcessedAheadOfEnqueued {
                job_id: job_id.to_string(),
                processed: status.processed_max,
                enqueued: current.queue.enqueued_max,
            });
        }

        let entry = jobs.entry(job_id.clone()).or_default();
        entry.processing.processed_max = entry.processing.processed_max.max(status.processed_max);
        Ok(*entry)
    }
}
