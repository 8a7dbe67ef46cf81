use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use registry_core::ImportJobId;

use super::{ImportItemStore, ImportItemStoreError};

/// In-memory item store for tests/dev. Values are the `sent` flag.
#[derive(Debug, Default)]
pub struct InMemoryImportItemStore {
    jobs: Mutex<HashMap<ImportJobId, BTreeMap<u64, bool>>>,
}

impl InMemoryImportItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of positions tracked for `job_id`.
    pub fn len(&self, job_id: &ImportJobId) -> usize {
        self.jobs
            .lock()
            .map(|jobs| jobs.get(job_id).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    fn with_job<R>(
        &self,
        job_id: &ImportJobId,
        f: impl FnOnce(&mut BTreeMap<u64, bool>) -> R,
    ) -> Result<R, ImportItemStoreError> {
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| ImportItemStoreError::Storage("item store lock poisoned".to_string()))?;
        Ok(f(jobs.entry(job_id.clone()).or_default()))
    }
}

#[async_trait]
impl ImportItemStore for InMemoryImportItemStore {
    async fn record_pending(&self, job_id: &ImportJobId, positions: &[u64]) -> Result<(), ImportItemStoreError> {
        self.with_job(job_id, |items| {
            for &p in positions {
                items.entry(p).or_insert(false);
            }
        })
    }

    async fn mark_sent(&self, job_id: &ImportJobId, positions: &[u64]) -> Result<(), ImportItemStoreError> {
        self.with_job(job_id, |items| {
            for &p in positions {
                if let Some(sent) = items.get_mut(&p) {
                    *sent = true;
                }
            }
        })
    }

    async fn sent_among(
        &self,
        job_id: &ImportJobId,
        positions: &[u64],
    ) -> Result<HashSet<u64>, ImportItemStoreError> {
        self.with_job(job_id, |items| {
            positions
                .iter()
                .copied()
                .filter(|p| items.get(p).copied().unwrap_or(false))
                .collect()
        })
    }

    async fn first_unsent(&self, job_id: &ImportJobId) -> Result<Option<u64>, ImportItemStoreError> {
        self.with_job(job_id, |items| {
            items.iter().find(|(_, sent)| !**sent).map(|(p, _)| *p)
        })
    }

    async fn clear(&self, job_id: &ImportJobId) -> Result<u64, ImportItemStoreError> {
        self.with_job(job_id, |items| {
            let removed = items.len() as u64;
            items.clear();
            removed
        })
    }
}
