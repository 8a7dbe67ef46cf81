//! Shared fixtures for unit and integration tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use registry_core::{Clock, ImportJobId, LeaseId};
use registry_messaging::CommandEnvelope;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::import::{ImportError, ImportSource, UpstreamPage};

use crate::leases::{
    LeaseAcquireResult, LeaseError, LeaseFilter, LeaseProvider, LeaseReleaseResult, LeaseTicket,
};

/// Wall clock that follows Tokio's (pausable) time.
pub(crate) struct TokioClock {
    base: DateTime<Utc>,
    start: tokio::time::Instant,
}

impl TokioClock {
    pub(crate) fn arc() -> Arc<Self> {
        Arc::new(Self {
            base: Utc::now(),
            start: tokio::time::Instant::now(),
        })
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        self.base + chrono::Duration::from_std(self.start.elapsed()).unwrap_or(chrono::Duration::zero())
    }
}

/// Lease provider wrapper that counts calls and can reject or fail renewals.
pub(crate) struct CountingLeaseProvider<P> {
    inner: P,
    acquires: AtomicU32,
    renewals: AtomicU32,
    releases: AtomicU32,
    reject_renewals: AtomicBool,
    fail_renewals: AtomicBool,
}

impl<P: LeaseProvider> CountingLeaseProvider<P> {
    pub(crate) fn arc(inner: P) -> Arc<Self> {
        Arc::new(Self {
            inner,
            acquires: AtomicU32::new(0),
            renewals: AtomicU32::new(0),
            releases: AtomicU32::new(0),
            reject_renewals: AtomicBool::new(false),
            fail_renewals: AtomicBool::new(false),
        })
    }

    pub(crate) fn reject_renewals(&self, reject: bool) {
        self.reject_renewals.store(reject, Ordering::SeqCst);
    }

    /// Make renewals return a storage error without touching the store.
    pub(crate) fn fail_renewals(&self, fail: bool) {
        self.fail_renewals.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn acquires(&self) -> u32 {
        self.acquires.load(Ordering::SeqCst)
    }

    /// Renewal attempts, including rejected ones.
    pub(crate) fn renewals(&self) -> u32 {
        self.renewals.load(Ordering::SeqCst)
    }

    /// Releases that actually freed the lease.
    pub(crate) fn releases(&self) -> u32 {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<P: LeaseProvider> LeaseProvider for CountingLeaseProvider<P> {
    async fn try_acquire_lease(
        &self,
        lease_id: &LeaseId,
        duration: Duration,
        filter: Option<&LeaseFilter>,
    ) -> Result<LeaseAcquireResult, LeaseError> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        self.inner.try_acquire_lease(lease_id, duration, filter).await
    }

    async fn try_renew_lease(
        &self,
        ticket: &LeaseTicket,
        duration: Duration,
    ) -> Result<LeaseAcquireResult, LeaseError> {
        self.renewals.fetch_add(1, Ordering::SeqCst);
        if self.fail_renewals.load(Ordering::SeqCst) {
            return Err(LeaseError::Storage("connection reset".to_string()));
        }
        if self.reject_renewals.load(Ordering::SeqCst) {
            return Ok(LeaseAcquireResult::Failed {
                expires: Some(ticket.expires()),
                history: Default::default(),
            });
        }
        self.inner.try_renew_lease(ticket, duration).await
    }

    async fn release_lease(&self, ticket: &LeaseTicket) -> Result<LeaseReleaseResult, LeaseError> {
        let result = self.inner.release_lease(ticket).await?;
        if result == LeaseReleaseResult::Released {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
        Ok(result)
    }
}

/// Upstream of dense positions `1..=total`, served in fixed-size pages.
pub(crate) struct RangeSource {
    total: AtomicU64,
    page_size: u64,
    fetches: AtomicU32,
}

impl RangeSource {
    pub(crate) const COMMAND_TYPE: &'static str = "test.import_item";

    pub(crate) fn new(total: u64, page_size: u64) -> Self {
        Self {
            total: AtomicU64::new(total),
            page_size,
            fetches: AtomicU32::new(0),
        }
    }

    /// Simulate new upstream rows appearing.
    pub(crate) fn grow_to(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
    }

    pub(crate) fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImportSource for RangeSource {
    async fn fetch_page(&self, after: u64) -> Result<UpstreamPage, ImportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let total = self.total.load(Ordering::SeqCst);
        let end = after.saturating_add(self.page_size).min(total);
        Ok(UpstreamPage {
            positions: (after + 1..=end).collect(),
            source_max: Some(total),
        })
    }

    fn command_for(
        &self,
        job_id: &ImportJobId,
        position: u64,
        _enqueued_at: DateTime<Utc>,
    ) -> Result<CommandEnvelope<JsonValue>, ImportError> {
        Ok(CommandEnvelope::new(
            Uuid::now_v7(),
            Self::COMMAND_TYPE,
            format!("{job_id}:{position}"),
            serde_json::json!({ "position": position }),
        ))
    }
}
