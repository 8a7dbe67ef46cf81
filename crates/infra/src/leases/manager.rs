use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{Span, instrument, warn};

use registry_core::{Clock, LeaseId, SystemClock};

use super::owned::OwnedLease;
use super::provider::LeaseProvider;
use super::types::{
    LeaseAcquireResult, LeaseError, LeaseFilter, LeaseHistory, LeaseReleaseResult, LeaseTicket,
};
use crate::config::{ConfigError, LeaseConfig};

/// Result of [`LeaseManager::acquire_lease`].
///
/// When the lease was not acquired, `expires` and `history` describe the
/// current holder so callers can decide whether to back off.
#[must_use = "a held lease must be released"]
#[derive(Debug)]
pub struct Lease {
    owned: Option<OwnedLease>,
    expires: Option<DateTime<Utc>>,
    history: LeaseHistory,
}

impl Lease {
    pub fn is_acquired(&self) -> bool {
        self.owned.is_some()
    }

    /// Expiry of the held lease, or of the current holder's lease.
    pub fn expires(&self) -> Option<DateTime<Utc>> {
        match &self.owned {
            Some(owned) => Some(owned.expires()),
            None => self.expires,
        }
    }

    pub fn history(&self) -> LeaseHistory {
        self.history
    }

    pub fn ticket(&self) -> Option<LeaseTicket> {
        self.owned.as_ref().map(OwnedLease::ticket)
    }

    /// Signal that fires when the held lease is lost or released.
    pub fn cancellation_token(&self) -> Option<CancellationToken> {
        self.owned.as_ref().map(OwnedLease::cancellation_token)
    }

    /// Release the held lease, if any.
    pub async fn release(self) -> Result<LeaseReleaseResult, LeaseError> {
        match self.owned {
            Some(owned) => owned.release().await,
            None => Ok(LeaseReleaseResult::NotHeld),
        }
    }
}

/// Hands out auto-renewing leases.
#[derive(Clone)]
pub struct LeaseManager {
    provider: Arc<dyn LeaseProvider>,
    clock: Arc<dyn Clock>,
    config: LeaseConfig,
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LeaseManager {
    /// Rejects timing that would renew without ever sleeping, such as a
    /// renewal margin that is not shorter than the lease duration.
    pub fn new(provider: Arc<dyn LeaseProvider>, config: LeaseConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            provider,
            clock: Arc::new(SystemClock),
            config,
        })
    }

    /// Clock used to schedule renewals. Should match the provider's clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Try once to acquire `lease_id`; never waits for a current holder.
    ///
    /// The returned lease's cancellation token is a child of `cancel`, so
    /// cancelling the caller also tears the lease down. Cancellation while the
    /// store call is in flight returns [`LeaseError::Cancelled`]; a lease that
    /// was committed by that call is left to expire.
    #[instrument(skip(self, filter, cancel), fields(lease_id = %lease_id, acquired), err)]
    pub async fn acquire_lease(
        &self,
        lease_id: &LeaseId,
        filter: Option<&LeaseFilter>,
        cancel: &CancellationToken,
    ) -> Result<Lease, LeaseError> {
        if cancel.is_cancelled() {
            return Err(LeaseError::Cancelled);
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LeaseError::Cancelled),
            result = self.provider.try_acquire_lease(lease_id, self.config.duration, filter) => result?,
        };

        let (ticket, history) = match result {
            LeaseAcquireResult::Acquired { ticket, history } => (ticket, history),
            LeaseAcquireResult::Failed { expires, history } => {
                Span::current().record("acquired", false);
                return Ok(Lease {
                    owned: None,
                    expires,
                    history,
                });
            }
        };

        if cancel.is_cancelled() {
            self.release_orphan(&ticket).await;
            return Err(LeaseError::Cancelled);
        }

        let owned = match OwnedLease::start(
            self.provider.clone(),
            self.clock.clone(),
            ticket.clone(),
            cancel.child_token(),
            self.config.duration,
            self.config.renewal_margin,
        ) {
            Ok(owned) => owned,
            Err(err) => {
                self.release_orphan(&ticket).await;
                return Err(err);
            }
        };

        Span::current().record("acquired", true);
        Ok(Lease {
            expires: Some(ticket.expires()),
            owned: Some(owned),
            history,
        })
    }

    /// Release a ticket that never made it into an [`OwnedLease`].
    async fn release_orphan(&self, ticket: &LeaseTicket) {
        if let Err(err) = self.provider.release_lease(ticket).await {
            warn!(lease_id = %ticket.lease_id(), error = %err, "failed to release unowned lease; it will expire");
        }
    }
}
