//! Auto-renewing handle over one acquired lease.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use registry_core::Clock;

use super::provider::LeaseProvider;
use super::types::{LeaseAcquireResult, LeaseError, LeaseReleaseResult, LeaseTicket};

/// Sole owner of one acquired ticket and its renewal.
///
/// A background task renews the lease `renewal_margin` before each expiry.
/// If a renewal fails, the lease is considered lost: the cancellation token
/// fires and no further renewal is attempted.
///
/// Must be disposed with [`OwnedLease::release`]. Dropping it without release
/// is logged as a leak and falls back to a best-effort background release.
#[must_use = "an owned lease must be released"]
pub struct OwnedLease {
    shared: Arc<Shared>,
    renewal: Option<JoinHandle<()>>,
    disposed: bool,
}

struct Shared {
    provider: Arc<dyn LeaseProvider>,
    clock: Arc<dyn Clock>,
    ticket: Mutex<LeaseTicket>,
    /// Serializes renewal against disposal; `true` once disposed.
    transition: tokio::sync::Mutex<bool>,
    lost: AtomicBool,
    token: CancellationToken,
    duration: Duration,
    renewal_margin: Duration,
}

impl std::fmt::Debug for OwnedLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedLease")
            .field("ticket", &self.ticket())
            .field("lost", &self.is_lost())
            .finish_non_exhaustive()
    }
}

impl OwnedLease {
    /// Take ownership of `ticket` and start renewing it.
    ///
    /// Fails only if there is no Tokio runtime to run the renewal task on.
    pub(crate) fn start(
        provider: Arc<dyn LeaseProvider>,
        clock: Arc<dyn Clock>,
        ticket: LeaseTicket,
        token: CancellationToken,
        duration: Duration,
        renewal_margin: Duration,
    ) -> Result<Self, LeaseError> {
        let handle = Handle::try_current().map_err(|e| LeaseError::Runtime(e.to_string()))?;

        let shared = Arc::new(Shared {
            provider,
            clock,
            ticket: Mutex::new(ticket),
            transition: tokio::sync::Mutex::new(false),
            lost: AtomicBool::new(false),
            token,
            duration,
            renewal_margin,
        });
        let renewal = handle.spawn(renew_until_lost(shared.clone()));

        Ok(Self {
            shared,
            renewal: Some(renewal),
            disposed: false,
        })
    }

    /// Last ticket written by acquire or renewal.
    pub fn ticket(&self) -> LeaseTicket {
        self.shared.current_ticket()
    }

    pub fn expires(&self) -> DateTime<Utc> {
        self.shared.current_ticket().expires()
    }

    /// Fires when the lease is lost, released, or the caller's token is cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.token.clone()
    }

    /// Whether a renewal attempt failed.
    pub fn is_lost(&self) -> bool {
        self.shared.lost.load(Ordering::Acquire)
    }

    /// Stop renewing and release the lease.
    ///
    /// Waits for an in-flight renewal to finish first, then releases the
    /// latest ticket exactly once. A lost lease is still released: the
    /// release is token-guarded, so a superseded ticket reports `NotHeld`.
    pub async fn release(mut self) -> Result<LeaseReleaseResult, LeaseError> {
        self.disposed = true;
        let shared = self.shared.clone();

        let mut disposed = shared.transition.lock().await;
        *disposed = true;
        shared.token.cancel();
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
        }

        let ticket = shared.current_ticket();
        let result = shared.provider.release_lease(&ticket).await?;
        debug!(lease_id = %ticket.lease_id(), ?result, "lease released");
        Ok(result)
    }
}

impl Drop for OwnedLease {
    fn drop(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
        }
        if self.disposed {
            return;
        }

        let ticket = self.shared.current_ticket();
        if cfg!(debug_assertions) {
            error!(lease_id = %ticket.lease_id(), "owned lease dropped without release");
        } else {
            warn!(lease_id = %ticket.lease_id(), "owned lease dropped without release");
        }

        self.shared.token.cancel();

        // Without a runtime the lease simply runs out at its expiry.
        if let Ok(handle) = Handle::try_current() {
            let provider = self.shared.provider.clone();
            handle.spawn(async move {
                if let Err(err) = provider.release_lease(&ticket).await {
                    warn!(lease_id = %ticket.lease_id(), error = %err, "background lease release failed");
                }
            });
        }
    }
}

impl Shared {
    fn current_ticket(&self) -> LeaseTicket {
        self.ticket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn replace_ticket(&self, ticket: LeaseTicket) {
        *self.ticket.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = ticket;
    }

    fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
        self.token.cancel();
    }

    /// Time left until the next renewal should fire; zero if already due.
    fn delay_until_renewal(&self) -> Duration {
        let margin = chrono::Duration::from_std(self.renewal_margin).unwrap_or(chrono::Duration::zero());
        let fire_at = self.current_ticket().expires() - margin;
        (fire_at - self.clock.now()).to_std().unwrap_or(Duration::ZERO)
    }

    /// One renewal attempt. Returns whether renewal should continue.
    async fn renew(&self) -> bool {
        let disposed = self.transition.lock().await;
        if *disposed || self.token.is_cancelled() {
            return false;
        }

        let ticket = self.current_ticket();
        match self.provider.try_renew_lease(&ticket, self.duration).await {
            Ok(LeaseAcquireResult::Acquired { ticket: renewed, .. }) => {
                debug!(lease_id = %renewed.lease_id(), expires = %renewed.expires(), "lease renewed");
                self.replace_ticket(renewed);
                true
            }
            Ok(LeaseAcquireResult::Failed { expires, .. }) => {
                warn!(lease_id = %ticket.lease_id(), ?expires, "lease lost: renewal rejected");
                self.mark_lost();
                false
            }
            Err(err) => {
                error!(lease_id = %ticket.lease_id(), error = %err, "lease lost: renewal failed");
                self.mark_lost();
                false
            }
        }
    }
}

async fn renew_until_lost(shared: Arc<Shared>) {
    loop {
        // A past-due renewal (e.g. after a clock jump) fires immediately.
        let delay = shared.delay_until_renewal();
        if !delay.is_zero() {
            tokio::select! {
                _ = shared.token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if !shared.renew().await {
            return;
        }
    }
}
