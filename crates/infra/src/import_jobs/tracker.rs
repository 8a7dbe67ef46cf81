use std::sync::Arc;

use async_trait::async_trait;

use registry_core::ImportJobId;

use super::types::{ImportJobProcessingStatus, ImportJobQueueStatus, ImportJobStatus};

/// Errors from an import job tracker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImportJobTrackerError {
    /// A consumer reported more processed than was ever enqueued.
    ///
    /// Never clamped: it means a consumer raced ahead of its producer.
    #[error("job '{job_id}': processed {processed} is ahead of enqueued {enqueued}")]
    ProcessedAheadOfEnqueued {
        job_id: String,
        processed: u64,
        enqueued: u64,
    },

    #[error("watermark {0} does not fit the store")]
    OutOfRange(u64),

    #[error("tracker storage error: {0}")]
    Storage(String),
}

/// Read / monotonic-write access to import job watermarks.
///
/// Every write is max-wins per component, so stale, duplicate and
/// out-of-order updates are all safe. Writes return the status as stored
/// after the update.
#[async_trait]
pub trait ImportJobTracker: Send + Sync {
    /// Current watermarks; all-zero if the job was never tracked.
    async fn get_status(&self, job_id: &ImportJobId) -> Result<ImportJobStatus, ImportJobTrackerError>;

    async fn track_queue_status(
        &self,
        job_id: &ImportJobId,
        status: ImportJobQueueStatus,
    ) -> Result<ImportJobStatus, ImportJobTrackerError>;

    /// Rejects (never clamps) a `processed_max` above the stored `enqueued_max`.
    async fn track_processed_status(
        &self,
        job_id: &ImportJobId,
        status: ImportJobProcessingStatus,
    ) -> Result<ImportJobStatus, ImportJobTrackerError>;
}

#[async_trait]
impl<T> ImportJobTracker for Arc<T>
where
    T: ImportJobTracker + ?Sized,
{
    async fn get_status(&self, job_id: &ImportJobId) -> Result<ImportJobStatus, ImportJobTrackerError> {
        (**self).get_status(job_id).await
    }

    async fn track_queue_status(
        &self,
        job_id: &ImportJobId,
        status: ImportJobQueueStatus,
    ) -> Result<ImportJobStatus, ImportJobTrackerError> {
        (**self).track_queue_status(job_id, status).await
    }

    async fn track_processed_status(
        &self,
        job_id: &ImportJobId,
        status: ImportJobProcessingStatus,
    ) -> Result<ImportJobStatus, ImportJobTrackerError> {
        (**self).track_processed_status(job_id, status).await
    }
}
