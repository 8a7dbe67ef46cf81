//! Per-item idempotency state for incremental imports.
//!
//! A batch's positions are recorded as pending before it is sent and marked
//! sent afterwards. Pending rows left behind by a crashed or cancelled run
//! tell the next run where to resume, and sent rows keep it from re-sending.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use registry_core::ImportJobId;

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryImportItemStore;
pub use postgres::PostgresImportItemStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImportItemStoreError {
    #[error("position {0} does not fit the store")]
    OutOfRange(u64),

    #[error("item store error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait ImportItemStore: Send + Sync {
    /// Record positions about to be sent. Already-known positions are kept as they are.
    async fn record_pending(&self, job_id: &ImportJobId, positions: &[u64]) -> Result<(), ImportItemStoreError>;

    async fn mark_sent(&self, job_id: &ImportJobId, positions: &[u64]) -> Result<(), ImportItemStoreError>;

    /// The subset of `positions` already sent.
    async fn sent_among(
        &self,
        job_id: &ImportJobId,
        positions: &[u64],
    ) -> Result<HashSet<u64>, ImportItemStoreError>;

    /// Lowest recorded position that was never sent.
    async fn first_unsent(&self, job_id: &ImportJobId) -> Result<Option<u64>, ImportItemStoreError>;

    /// Drop all state for `job_id`; returns the number of rows removed.
    async fn clear(&self, job_id: &ImportJobId) -> Result<u64, ImportItemStoreError>;
}

#[async_trait]
impl<T> ImportItemStore for Arc<T>
where
    T: ImportItemStore + ?Sized,
{
    async fn record_pending(&self, job_id: &ImportJobId, positions: &[u64]) -> Result<(), ImportItemStoreError> {
        (**self).record_pending(job_id, positions).await
    }

    async fn mark_sent(&self, job_id: &ImportJobId, positions: &[u64]) -> Result<(), ImportItemStoreError> {
        (**self).mark_sent(job_id, positions).await
    }

    async fn sent_among(
        &self,
        job_id: &ImportJobId,
        positions: &[u64],
    ) -> Result<HashSet<u64>, ImportItemStoreError> {
        (**self).sent_among(job_id, positions).await
    }

    async fn first_unsent(&self, job_id: &ImportJobId) -> Result<Option<u64>, ImportItemStoreError> {
        (**self).first_unsent(job_id).await
    }

    async fn clear(&self, job_id: &ImportJobId) -> Result<u64, ImportItemStoreError> {
        (**self).clear(job_id).await
    }
}
