//! In-memory lease provider for tests/dev.
//!
//! Applies the same conditional-upsert rule as the Postgres provider, under a
//! single mutex instead of a transaction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use registry_core::{Clock, LeaseId, SystemClock};

use super::provider::LeaseProvider;
use super::types::{
    LeaseAcquireResult, LeaseError, LeaseFilter, LeaseHistory, LeaseInfo, LeaseReleaseResult,
    LeaseTicket, validate_duration,
};

#[derive(Debug, Clone)]
struct LeaseRow {
    token: Uuid,
    expires: DateTime<Utc>,
    acquired: Option<DateTime<Utc>>,
    released: Option<DateTime<Utc>>,
}

impl LeaseRow {
    fn history(&self) -> LeaseHistory {
        LeaseHistory {
            last_acquired_at: self.acquired,
            last_released_at: self.released,
        }
    }
}

/// One conditional write against the lease table.
struct Write<'a> {
    caller_token: Option<Uuid>,
    /// Whether a missing or expired row may be claimed (false for release).
    take_expired: bool,
    expires: DateTime<Utc>,
    acquired: Option<DateTime<Utc>>,
    released: Option<DateTime<Utc>>,
    filter: Option<&'a LeaseFilter>,
}

pub struct InMemoryLeaseProvider {
    rows: Mutex<HashMap<LeaseId, LeaseRow>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for InMemoryLeaseProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLeaseProvider").finish_non_exhaustive()
    }
}

impl Default for InMemoryLeaseProvider {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl InMemoryLeaseProvider {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Current expiry of a lease row, if one exists.
    pub fn expires(&self, lease_id: &LeaseId) -> Option<DateTime<Utc>> {
        self.rows
            .lock()
            .ok()
            .and_then(|rows| rows.get(lease_id).map(|r| r.expires))
    }

    fn apply(&self, lease_id: &LeaseId, write: Write<'_>) -> Result<LeaseAcquireResult, LeaseError> {
        let now = self.clock.now();
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| LeaseError::Storage("lease table lock poisoned".to_string()))?;

        let existing = rows.get(lease_id).cloned();
        let history = existing.as_ref().map(LeaseRow::history).unwrap_or_default();
        let failed = |row: Option<&LeaseRow>| LeaseAcquireResult::Failed {
            expires: row.map(|r| r.expires),
            history,
        };

        if let Some(filter) = write.filter {
            let info = LeaseInfo {
                lease_id: lease_id.clone(),
                expires: existing.as_ref().map(|r| r.expires),
                history,
                now,
            };
            if !filter(&info) {
                return Ok(failed(existing.as_ref()));
            }
        }

        let writable = match &existing {
            None => write.take_expired,
            Some(row) => {
                Some(row.token) == write.caller_token || (write.take_expired && row.expires <= now)
            }
        };
        if !writable {
            return Ok(failed(existing.as_ref()));
        }

        let token = Uuid::now_v7();
        let row = LeaseRow {
            token,
            expires: write.expires,
            acquired: write.acquired.or(existing.as_ref().and_then(|r| r.acquired)),
            released: write.released.or(existing.as_ref().and_then(|r| r.released)),
        };
        rows.insert(lease_id.clone(), row);

        Ok(LeaseAcquireResult::Acquired {
            ticket: LeaseTicket::new(lease_id.clone(), token, write.expires),
            history,
        })
    }
}

#[async_trait]
impl LeaseProvider for InMemoryLeaseProvider {
    async fn try_acquire_lease(
        &self,
        lease_id: &LeaseId,
        duration: Duration,
        filter: Option<&LeaseFilter>,
    ) -> Result<LeaseAcquireResult, LeaseError> {
        let duration = validate_duration(duration)?;
        let now = self.clock.now();
        self.apply(
            lease_id,
            Write {
                caller_token: None,
                take_expired: true,
                expires: now + duration,
                acquired: Some(now),
                released: None,
                filter,
            },
        )
    }

    async fn try_renew_lease(
        &self,
        ticket: &LeaseTicket,
        duration: Duration,
    ) -> Result<LeaseAcquireResult, LeaseError> {
        let duration = validate_duration(duration)?;
        let now = self.clock.now();
        self.apply(
            ticket.lease_id(),
            Write {
                caller_token: Some(ticket.token()),
                take_expired: true,
                expires: now + duration,
                acquired: None,
                released: None,
                filter: None,
            },
        )
    }

    async fn release_lease(&self, ticket: &LeaseTicket) -> Result<LeaseReleaseResult, LeaseError> {
        let now = self.clock.now();
        let result = self.apply(
            ticket.lease_id(),
            Write {
                caller_token: Some(ticket.token()),
                take_expired: false,
                expires: DateTime::<Utc>::UNIX_EPOCH,
                acquired: None,
                released: Some(now),
                filter: None,
            },
        )?;
        Ok(match result {
            LeaseAcquireResult::Acquired { .. } => LeaseReleaseResult::Released,
            LeaseAcquireResult::Failed { .. } => LeaseReleaseResult::NotHeld,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry_core::ManualClock;

    const MINUTE: Duration = Duration::from_secs(60);

    fn setup() -> (Arc<ManualClock>, InMemoryLeaseProvider) {
        let clock = ManualClock::arc(Utc::now());
        let provider = InMemoryLeaseProvider::new(clock.clone());
        (clock, provider)
    }

    fn id(name: &str) -> LeaseId {
        LeaseId::new(name).unwrap()
    }

    #[tokio::test]
    async fn second_acquire_fails_while_held() {
        let (_clock, provider) = setup();

        let first = provider.try_acquire_lease(&id("x"), MINUTE, None).await.unwrap();
        let second = provider.try_acquire_lease(&id("x"), MINUTE, None).await.unwrap();

        let ticket = first.ticket().unwrap();
        match second {
            LeaseAcquireResult::Failed { expires, history } => {
                assert_eq!(expires, Some(ticket.expires()));
                assert!(history.last_acquired_at.is_some());
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let (clock, provider) = setup();

        let first = provider.try_acquire_lease(&id("x"), MINUTE, None).await.unwrap();
        clock.advance(chrono::Duration::seconds(61));
        let second = provider.try_acquire_lease(&id("x"), MINUTE, None).await.unwrap();

        let (a, b) = (first.ticket().unwrap(), second.ticket().unwrap());
        assert_ne!(a.token(), b.token());

        // The old holder is fenced out.
        assert!(!provider.try_renew_lease(a, MINUTE).await.unwrap().is_acquired());
        assert_eq!(provider.release_lease(a).await.unwrap(), LeaseReleaseResult::NotHeld);
        assert_eq!(provider.expires(&id("x")), Some(b.expires()));
    }

    #[tokio::test]
    async fn renew_supersedes_the_old_ticket() {
        let (clock, provider) = setup();

        let acquired = provider.try_acquire_lease(&id("x"), MINUTE, None).await.unwrap();
        let old = acquired.ticket().unwrap().clone();
        clock.advance(chrono::Duration::seconds(30));

        let renewed = provider.try_renew_lease(&old, MINUTE).await.unwrap();
        let new = renewed.ticket().unwrap().clone();
        assert!(new.expires() > old.expires());

        assert!(!provider.try_renew_lease(&old, MINUTE).await.unwrap().is_acquired());
        assert_eq!(provider.release_lease(&old).await.unwrap(), LeaseReleaseResult::NotHeld);
        assert_eq!(provider.release_lease(&new).await.unwrap(), LeaseReleaseResult::Released);
    }

    #[tokio::test]
    async fn release_is_idempotent_and_frees_the_lease() {
        let (_clock, provider) = setup();

        let ticket = provider
            .try_acquire_lease(&id("x"), MINUTE, None)
            .await
            .unwrap()
            .ticket()
            .unwrap()
            .clone();

        assert_eq!(provider.release_lease(&ticket).await.unwrap(), LeaseReleaseResult::Released);
        assert_eq!(provider.release_lease(&ticket).await.unwrap(), LeaseReleaseResult::NotHeld);

        let again = provider.try_acquire_lease(&id("x"), MINUTE, None).await.unwrap();
        match again {
            LeaseAcquireResult::Acquired { history, .. } => {
                assert!(history.last_released_at.is_some());
            }
            other => panic!("expected acquire after release, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn filter_sees_history_and_can_decline() {
        let (clock, provider) = setup();
        let min_gap = chrono::Duration::minutes(5);

        let ticket = provider
            .try_acquire_lease(&id("x"), MINUTE, None)
            .await
            .unwrap()
            .ticket()
            .unwrap()
            .clone();
        provider.release_lease(&ticket).await.unwrap();

        let spaced = move |info: &LeaseInfo| {
            info.history
                .last_acquired_at
                .is_none_or(|at| info.now - at >= min_gap)
        };

        let early = provider.try_acquire_lease(&id("x"), MINUTE, Some(&spaced)).await.unwrap();
        assert!(!early.is_acquired());

        clock.advance(chrono::Duration::minutes(6));
        let later = provider.try_acquire_lease(&id("x"), MINUTE, Some(&spaced)).await.unwrap();
        assert!(later.is_acquired());
    }

    #[tokio::test]
    async fn rejects_oversized_durations() {
        let (_clock, provider) = setup();
        let err = provider
            .try_acquire_lease(&id("x"), Duration::from_secs(3600), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::InvalidDuration { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquires_have_one_winner() {
        let (_clock, provider) = setup();
        let provider = Arc::new(provider);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let provider = provider.clone();
                tokio::spawn(async move {
                    provider
                        .try_acquire_lease(&LeaseId::new("contended").unwrap(), MINUTE, None)
                        .await
                        .unwrap()
                        .is_acquired()
                })
            })
            .collect();

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
