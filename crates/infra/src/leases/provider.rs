use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use registry_core::LeaseId;

use super::types::{LeaseAcquireResult, LeaseError, LeaseFilter, LeaseReleaseResult, LeaseTicket};

/// Single-transaction lease primitive over the lease store.
///
/// Contention is a normal [`LeaseAcquireResult::Failed`], never an error.
/// Errors are reserved for invalid input and storage failures.
#[async_trait]
pub trait LeaseProvider: Send + Sync {
    /// Acquire `lease_id` if no one holds it (or it has expired) and
    /// `filter`, when given, accepts the current row.
    async fn try_acquire_lease(
        &self,
        lease_id: &LeaseId,
        duration: Duration,
        filter: Option<&LeaseFilter>,
    ) -> Result<LeaseAcquireResult, LeaseError>;

    /// Extend a held lease. Issues a fresh token; the old ticket is dead after
    /// a successful renew.
    async fn try_renew_lease(
        &self,
        ticket: &LeaseTicket,
        duration: Duration,
    ) -> Result<LeaseAcquireResult, LeaseError>;

    /// Expire the lease immediately. Releasing a superseded ticket is a no-op.
    async fn release_lease(&self, ticket: &LeaseTicket) -> Result<LeaseReleaseResult, LeaseError>;
}

#[async_trait]
impl<P> LeaseProvider for Arc<P>
where
    P: LeaseProvider + ?Sized,
{
    async fn try_acquire_lease(
        &self,
        lease_id: &LeaseId,
        duration: Duration,
        filter: Option<&LeaseFilter>,
    ) -> Result<LeaseAcquireResult, LeaseError> {
        (**self).try_acquire_lease(lease_id, duration, filter).await
    }

    async fn try_renew_lease(
        &self,
        ticket: &LeaseTicket,
        duration: Duration,
    ) -> Result<LeaseAcquireResult, LeaseError> {
        (**self).try_renew_lease(ticket, duration).await
    }

    async fn release_lease(&self, ticket: &LeaseTicket) -> Result<LeaseReleaseResult, LeaseError> {
        (**self).release_lease(ticket).await
    }
}
