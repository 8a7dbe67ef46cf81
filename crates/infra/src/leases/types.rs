//! Lease value types and errors.

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use registry_core::LeaseId;

/// Longest lease a caller may request.
///
/// Bounds how long a crashed holder can keep a job from running elsewhere.
pub const MAX_LEASE_DURATION: Duration = Duration::from_secs(15 * 60);

/// Capability to renew or release one acquired lease.
///
/// Only providers mint tickets; callers can copy one but never forge one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseTicket {
    lease_id: LeaseId,
    token: Uuid,
    expires: DateTime<Utc>,
}

impl LeaseTicket {
    pub(crate) fn new(lease_id: LeaseId, token: Uuid, expires: DateTime<Utc>) -> Self {
        Self {
            lease_id,
            token,
            expires,
        }
    }

    pub fn lease_id(&self) -> &LeaseId {
        &self.lease_id
    }

    /// Fencing token; changes on every successful acquire/renew.
    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn expires(&self) -> DateTime<Utc> {
        self.expires
    }
}

/// Informational history of a lease row. Never used for correctness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseHistory {
    pub last_acquired_at: Option<DateTime<Utc>>,
    pub last_released_at: Option<DateTime<Utc>>,
}

/// Snapshot of a lease row as seen by a [`LeaseFilter`].
///
/// `expires` is `None` when no row exists yet (an always-expired lease).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseInfo {
    pub lease_id: LeaseId,
    pub expires: Option<DateTime<Utc>>,
    pub history: LeaseHistory,
    /// Time the provider evaluated the filter at.
    pub now: DateTime<Utc>,
}

impl LeaseInfo {
    pub fn is_held(&self) -> bool {
        self.expires.is_some_and(|e| e > self.now)
    }
}

/// Extra acquisition condition evaluated against the current lease row,
/// inside the same transaction as the acquire.
pub type LeaseFilter = dyn Fn(&LeaseInfo) -> bool + Send + Sync;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAcquireResult {
    /// The caller now holds the lease. `history` is the row as it was
    /// before this acquisition.
    Acquired {
        ticket: LeaseTicket,
        history: LeaseHistory,
    },
    /// Someone else holds the lease, the caller's token was superseded, or the
    /// filter declined. `expires` is the current row's expiry, if any.
    Failed {
        expires: Option<DateTime<Utc>>,
        history: LeaseHistory,
    },
}

impl LeaseAcquireResult {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired { .. })
    }

    pub fn ticket(&self) -> Option<&LeaseTicket> {
        match self {
            Self::Acquired { ticket, .. } => Some(ticket),
            Self::Failed { .. } => None,
        }
    }

    pub fn history(&self) -> LeaseHistory {
        match self {
            Self::Acquired { history, .. } | Self::Failed { history, .. } => *history,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseReleaseResult {
    Released,
    /// The ticket had already been superseded; nothing was changed.
    NotHeld,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeaseError {
    #[error("lease duration {requested:?} must be positive and below {max:?}")]
    InvalidDuration { requested: Duration, max: Duration },

    /// Serialization conflicts persisted through every retry.
    #[error("lease '{lease_id}' still contended after {attempts} attempts")]
    Contended { lease_id: String, attempts: u32 },

    #[error("lease storage error: {0}")]
    Storage(String),

    #[error("lease acquisition cancelled")]
    Cancelled,

    #[error("lease renewal could not be scheduled: {0}")]
    Runtime(String),
}

/// Reject durations outside `(0, MAX_LEASE_DURATION)`.
pub(crate) fn validate_duration(duration: Duration) -> Result<chrono::Duration, LeaseError> {
    let invalid = || LeaseError::InvalidDuration {
        requested: duration,
        max: MAX_LEASE_DURATION,
    };
    if duration.is_zero() || duration >= MAX_LEASE_DURATION {
        return Err(invalid());
    }
    chrono::Duration::from_std(duration).map_err(|_| invalid())
}
