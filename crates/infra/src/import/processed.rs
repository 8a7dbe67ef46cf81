//! Consumer side of an import: handle the command, then report progress.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::{debug, instrument};

use registry_core::ImportJobId;
use registry_messaging::{CommandEnvelope, CommandHandler, HandlerError};
use registry_parties::{A2UserId, ImportA2UserParty};

use crate::import_jobs::{ImportJobProcessingStatus, ImportJobStatus, ImportJobTracker, ImportJobTrackerError};

/// Reports consumer progress back to the import job tracker.
///
/// Reports are max-wins, so redeliveries and out-of-order completions never
/// move the processed watermark backwards.
#[derive(Clone)]
pub struct ProcessedWatermarkReporter {
    tracker: Arc<dyn ImportJobTracker>,
}

impl ProcessedWatermarkReporter {
    pub fn new(tracker: Arc<dyn ImportJobTracker>) -> Self {
        Self { tracker }
    }

    pub async fn report(&self, job_id: &ImportJobId, position: u64) -> Result<ImportJobStatus, ImportJobTrackerError> {
        self.tracker
            .track_processed_status(job_id, ImportJobProcessingStatus::new(position))
            .await
    }
}

/// Where imported A2 users end up. Must be an idempotent upsert by user id.
#[async_trait]
pub trait A2PartySink: Send + Sync {
    async fn upsert_a2_user(&self, user_id: A2UserId) -> Result<(), HandlerError>;
}

#[async_trait]
impl<T> A2PartySink for Arc<T>
where
    T: A2PartySink + ?Sized,
{
    async fn upsert_a2_user(&self, user_id: A2UserId) -> Result<(), HandlerError> {
        (**self).upsert_a2_user(user_id).await
    }
}

/// Handles [`ImportA2UserParty`] commands.
pub struct A2UserPartyHandler<S> {
    sink: S,
    reporter: ProcessedWatermarkReporter,
}

impl<S: A2PartySink> A2UserPartyHandler<S> {
    pub fn new(sink: S, reporter: ProcessedWatermarkReporter) -> Self {
        Self { sink, reporter }
    }
}

#[async_trait]
impl<S: A2PartySink> CommandHandler for A2UserPartyHandler<S> {
    fn command_type(&self) -> &'static str {
        <ImportA2UserParty as registry_messaging::Command>::COMMAND_TYPE
    }

    #[instrument(skip_all, fields(key = envelope.idempotency_key()), err)]
    async fn handle(&self, envelope: &CommandEnvelope<JsonValue>) -> Result<(), HandlerError> {
        let command: ImportA2UserParty = envelope
            .decode()
            .map_err(|e| HandlerError::Rejected(e.to_string()))?;
        let job_id = ImportJobId::new(command.import_job.as_str()).map_err(|e| HandlerError::Rejected(e.to_string()))?;

        self.sink.upsert_a2_user(command.user_id).await?;

        match self.reporter.report(&job_id, command.position()).await {
            Ok(status) => {
                debug!(processed_max = status.processed_max(), "processed watermark reported");
                Ok(())
            }
            // The producer sends before it commits the watermark; redeliver
            // once the commit has landed.
            Err(e @ ImportJobTrackerError::ProcessedAheadOfEnqueued { .. }) => {
                Err(HandlerError::Retryable(e.to_string()))
            }
            Err(ImportJobTrackerError::Storage(e)) => Err(HandlerError::Retryable(e)),
            Err(e @ ImportJobTrackerError::OutOfRange(_)) => Err(HandlerError::Rejected(e.to_string())),
        }
    }
}
