use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::instrument;

use registry_core::ImportJobId;

use super::{ImportItemStore, ImportItemStoreError};
use crate::db::{describe, from_bigint, to_bigint};

/// Item store over the `import_job_item` table.
#[derive(Debug, Clone)]
pub struct PostgresImportItemStore {
    pool: Arc<PgPool>,
}

impl PostgresImportItemStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn bigints(positions: &[u64]) -> Result<Vec<i64>, ImportItemStoreError> {
    positions
        .iter()
        .map(|&p| to_bigint(p).ok_or(ImportItemStoreError::OutOfRange(p)))
        .collect()
}

fn storage(operation: &str, err: sqlx::Error) -> ImportItemStoreError {
    ImportItemStoreError::Storage(describe(operation, &err))
}

#[async_trait]
impl ImportItemStore for PostgresImportItemStore {
    #[instrument(skip(self, positions), fields(job_id = %job_id, count = positions.len()), err)]
    async fn record_pending(&self, job_id: &ImportJobId, positions: &[u64]) -> Result<(), ImportItemStoreError> {
        sqlx::query(
            r#"
            INSERT INTO import_job_item (job_id, position)
            SELECT $1, unnest($2::BIGINT[])
            ON CONFLICT (job_id, position) DO NOTHING
            "#,
        )
        .bind(job_id.as_str())
        .bind(bigints(positions)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| storage("record_pending", e))?;
        Ok(())
    }

    #[instrument(skip(self, positions), fields(job_id = %job_id, count = positions.len()), err)]
    async fn mark_sent(&self, job_id: &ImportJobId, positions: &[u64]) -> Result<(), ImportItemStoreError> {
        sqlx::query(
            r#"
            UPDATE import_job_item
            SET sent = TRUE
            WHERE job_id = $1 AND position = ANY($2)
            "#,
        )
        .bind(job_id.as_str())
        .bind(bigints(positions)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| storage("mark_sent", e))?;
        Ok(())
    }

    async fn sent_among(
        &self,
        job_id: &ImportJobId,
        positions: &[u64],
    ) -> Result<HashSet<u64>, ImportItemStoreError> {
        let sent: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT position
            FROM import_job_item
            WHERE job_id = $1 AND sent AND position = ANY($2)
            "#,
        )
        .bind(job_id.as_str())
        .bind(bigints(positions)?)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| storage("sent_among", e))?;

        Ok(sent.into_iter().map(from_bigint).collect())
    }

    async fn first_unsent(&self, job_id: &ImportJobId) -> Result<Option<u64>, ImportItemStoreError> {
        let first: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MIN(position)
            FROM import_job_item
            WHERE job_id = $1 AND NOT sent
            "#,
        )
        .bind(job_id.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| storage("first_unsent", e))?;

        Ok(first.map(from_bigint))
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn clear(&self, job_id: &ImportJobId) -> Result<u64, ImportItemStoreError> {
        let result = sqlx::query("DELETE FROM import_job_item WHERE job_id = $1")
            .bind(job_id.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| storage("clear", e))?;
        Ok(result.rows_affected())
    }
}
