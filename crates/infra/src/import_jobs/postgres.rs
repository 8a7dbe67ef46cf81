//! Postgres-backed import job tracker.
//!
//! Each write is one statement using `GREATEST`, so concurrent writers from
//! any number of hosts converge on the component-wise max. `GREATEST` ignores
//! NULL, which is what keeps an unknown `source_max` from erasing a known one.
//!
//! `processed_max <= enqueued_max` is a table CHECK constraint; a violation
//! (SQLSTATE `23514`) surfaces as
//! [`ImportJobTrackerError::ProcessedAheadOfEnqueued`].

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use tracing::instrument;

use registry_core::ImportJobId;

use super::tracker::{ImportJobTracker, ImportJobTrackerError};
use super::types::{ImportJobProcessingStatus, ImportJobQueueStatus, ImportJobStatus};
use crate::db::{describe, from_bigint, is_check_violation, to_bigint};

const SELECT_STATUS: &str = r#"
    SELECT enqueued_max, source_max, processed_max
    FROM import_job_status
    WHERE job_id = $1
"#;

const TRACK_QUEUE: &str = r#"
    INSERT INTO import_job_status (job_id, enqueued_max, source_max, processed_max, updated_at)
    VALUES ($1, $2, $3, 0, now())
    ON CONFLICT (job_id) DO UPDATE
        SET enqueued_max = GREATEST(import_job_status.enqueued_max, EXCLUDED.enqueued_max),
            source_max = GREATEST(import_job_status.source_max, EXCLUDED.source_max),
            updated_at = now()
    RETURNING enqueued_max, source_max, processed_max
"#;

// UPDATE rather than upsert: an INSERT would be checked against the proposed
// row (enqueued_max = 0) before the conflict is detected.
const TRACK_PROCESSED: &str = r#"
    UPDATE import_job_status
    SET processed_max = GREATEST(processed_max, $2),
        updated_at = now()
    WHERE job_id = $1
    RETURNING enqueued_max, source_max, processed_max
"#;

#[derive(Debug, FromRow)]
struct StatusRow {
    enqueued_max: i64,
    source_max: Option<i64>,
    processed_max: i64,
}

impl From<StatusRow> for ImportJobStatus {
    fn from(row: StatusRow) -> Self {
        Self {
            queue: ImportJobQueueStatus::new(
                from_bigint(row.enqueued_max),
                row.source_max.map(from_bigint),
            ),
            processing: ImportJobProcessingStatus::new(from_bigint(row.processed_max)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PostgresImportJobTracker {
    pool: Arc<PgPool>,
}

impl PostgresImportJobTracker {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn bigint(value: u64) -> Result<i64, ImportJobTrackerError> {
    to_bigint(value).ok_or(ImportJobTrackerError::OutOfRange(value))
}

fn storage(operation: &str, err: sqlx::Error) -> ImportJobTrackerError {
    ImportJobTrackerError::Storage(describe(operation, &err))
}

#[async_trait]
impl ImportJobTracker for PostgresImportJobTracker {
    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get_status(&self, job_id: &ImportJobId) -> Result<ImportJobStatus, ImportJobTrackerError> {
        let row: Option<StatusRow> = sqlx::query_as(SELECT_STATUS)
            .bind(job_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| storage("get_status", e))?;

        Ok(row.map(ImportJobStatus::from).unwrap_or_default())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn track_queue_status(
        &self,
        job_id: &ImportJobId,
        status: ImportJobQueueStatus,
    ) -> Result<ImportJobStatus, ImportJobTrackerError> {
        let source_max = status.source_max.map(bigint).transpose()?;

        let row: StatusRow = sqlx::query_as(TRACK_QUEUE)
            .bind(job_id.as_str())
            .bind(bigint(status.enqueued_max)?)
            .bind(source_max)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| storage("track_queue_status", e))?;

        Ok(row.into())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn track_processed_status(
        &self,
        job_id: &ImportJobId,
        status: ImportJobProcessingStatus,
    ) -> Result<ImportJobStatus, ImportJobTrackerError> {
        let result = sqlx::query_as::<_, StatusRow>(TRACK_PROCESSED)
            .bind(job_id.as_str())
            .bind(bigint(status.processed_max)?)
            .fetch_optional(&*self.pool)
            .await;

        let ahead = |enqueued: u64| ImportJobTrackerError::ProcessedAheadOfEnqueued {
            job_id: job_id.to_string(),
            processed: status.processed_max,
            enqueued,
        };

        match result {
            Ok(Some(row)) => Ok(row.into()),
            // Untracked job: only a zero report is admissible.
            Ok(None) if status.processed_max == 0 => Ok(ImportJobStatus::default()),
            Ok(None) => Err(ahead(0)),
            Err(err) if is_check_violation(&err) => {
                let current = self.get_status(job_id).await?;
                Err(ahead(current.enqueued_max()))
            }
            Err(err) => Err(storage("track_processed_status", err)),
        }
    }
}
