//! Postgres-backed lease provider.
//!
//! Every operation is one repeatable-read transaction around a single
//! conditional write, so concurrent hosts never need a client-side
//! read-modify-write:
//!
//! - acquire / renew: `INSERT .. ON CONFLICT DO UPDATE .. WHERE token = caller OR expires <= now`
//! - release: `UPDATE .. WHERE token = caller`, setting `expires` to the UNIX epoch
//!
//! A write whose condition does not match is a no-op and is reported as
//! [`LeaseAcquireResult::Failed`] with the row's real expiry.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | LeaseError |
//! |------------|----------------------|------------|
//! | Database (serialization failure) | `40001` | retried, then `Contended` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::{Span, debug, instrument};
use uuid::Uuid;

use registry_core::{Clock, LeaseId, SystemClock};

use super::provider::LeaseProvider;
use super::types::{
    LeaseAcquireResult, LeaseError, LeaseFilter, LeaseHistory, LeaseInfo, LeaseReleaseResult,
    LeaseTicket, validate_duration,
};
use crate::db::{describe, is_serialization_failure};
use crate::retry::{RetryError, RetryPolicy};

const SELECT_LEASE: &str = r#"
    SELECT token, expires, acquired, released
    FROM lease
    WHERE id = $1
"#;

const UPSERT_LEASE: &str = r#"
    INSERT INTO lease (id, token, expires, acquired, released)
    VALUES ($1, $2, $3, $4, NULL)
    ON CONFLICT (id) DO UPDATE
        SET token = EXCLUDED.token,
            expires = EXCLUDED.expires,
            acquired = COALESCE(EXCLUDED.acquired, lease.acquired)
        WHERE lease.token = $5 OR lease.expires <= $6
    RETURNING token, expires, acquired, released
"#;

const RELEASE_LEASE: &str = r#"
    UPDATE lease
    SET token = $3, expires = $4, released = $5
    WHERE id = $1 AND token = $2
    RETURNING token
"#;

#[derive(Debug, FromRow)]
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

/// Lease provider over the `lease` table.
///
/// `Send + Sync`; clone freely (the pool is shared).
#[derive(Clone)]
pub struct PostgresLeaseProvider {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for PostgresLeaseProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresLeaseProvider")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl PostgresLeaseProvider {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::default(),
        }
    }

    /// Use `clock` for "now" instead of the system time.
    ///
    /// All hosts sharing a lease table should agree on time to within the
    /// renewal margin.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Retry policy for serialization failures.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    async fn write_once(
        &self,
        lease_id: &LeaseId,
        caller_token: Option<Uuid>,
        duration: chrono::Duration,
        filter: Option<&LeaseFilter>,
    ) -> Result<LeaseAcquireResult, sqlx::Error> {
        let now = self.clock.now();
        let mut tx = self.begin().await?;

        let existing: Option<LeaseRow> = sqlx::query_as(SELECT_LEASE)
            .bind(lease_id.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        let history = existing.as_ref().map(LeaseRow::history).unwrap_or_default();

        if let Some(filter) = filter {
            let info = LeaseInfo {
                lease_id: lease_id.clone(),
                expires: existing.as_ref().map(|r| r.expires),
                history,
                now,
            };
            if !filter(&info) {
                tx.rollback().await?;
                return Ok(LeaseAcquireResult::Failed {
                    expires: info.expires,
                    history,
                });
            }
        }

        let acquired_at = caller_token.is_none().then_some(now);
        let written: Option<LeaseRow> = sqlx::query_as(UPSERT_LEASE)
            .bind(lease_id.as_str())
            .bind(Uuid::now_v7())
            .bind(now + duration)
            .bind(acquired_at)
            .bind(caller_token)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

        let result = match written {
            Some(row) => LeaseAcquireResult::Acquired {
                ticket: LeaseTicket::new(lease_id.clone(), row.token, row.expires),
                history,
            },
            None => {
                let expires: Option<DateTime<Utc>> =
                    sqlx::query_scalar("SELECT expires FROM lease WHERE id = $1")
                        .bind(lease_id.as_str())
                        .fetch_optional(&mut *tx)
                        .await?;
                LeaseAcquireResult::Failed { expires, history }
            }
        };

        tx.commit().await?;
        Ok(result)
    }

    async fn release_once(&self, ticket: &LeaseTicket) -> Result<LeaseReleaseResult, sqlx::Error> {
        let now = self.clock.now();
        let mut tx = self.begin().await?;

        let released: Option<Uuid> = sqlx::query_scalar(RELEASE_LEASE)
            .bind(ticket.lease_id().as_str())
            .bind(ticket.token())
            .bind(Uuid::now_v7())
            .bind(DateTime::<Utc>::UNIX_EPOCH)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(match released {
            Some(_) => LeaseReleaseResult::Released,
            None => LeaseReleaseResult::NotHeld,
        })
    }

    async fn write(
        &self,
        operation: &'static str,
        lease_id: &LeaseId,
        caller_token: Option<Uuid>,
        duration: Duration,
        filter: Option<&LeaseFilter>,
    ) -> Result<LeaseAcquireResult, LeaseError> {
        let duration = validate_duration(duration)?;
        let result = self
            .retry
            .run(is_serialization_failure, move || {
                self.write_once(lease_id, caller_token, duration, filter)
            })
            .await
            .map_err(|e| map_retry_error(operation, lease_id, e))?;

        Span::current().record("acquired", result.is_acquired());
        Ok(result)
    }
}

#[async_trait]
impl LeaseProvider for PostgresLeaseProvider {
    #[instrument(skip(self, filter), fields(lease_id = %lease_id, acquired), err)]
    async fn try_acquire_lease(
        &self,
        lease_id: &LeaseId,
        duration: Duration,
        filter: Option<&LeaseFilter>,
    ) -> Result<LeaseAcquireResult, LeaseError> {
        self.write("try_acquire_lease", lease_id, None, duration, filter)
            .await
    }

    #[instrument(skip(self, ticket), fields(lease_id = %ticket.lease_id(), acquired), err)]
    async fn try_renew_lease(
        &self,
        ticket: &LeaseTicket,
        duration: Duration,
    ) -> Result<LeaseAcquireResult, LeaseError> {
        self.write(
            "try_renew_lease",
            ticket.lease_id(),
            Some(ticket.token()),
            duration,
            None,
        )
        .await
    }

    #[instrument(skip(self, ticket), fields(lease_id = %ticket.lease_id()), err)]
    async fn release_lease(&self, ticket: &LeaseTicket) -> Result<LeaseReleaseResult, LeaseError> {
        let result = self
            .retry
            .run(is_serialization_failure, move || self.release_once(ticket))
            .await
            .map_err(|e| map_retry_error("release_lease", ticket.lease_id(), e))?;

        debug!(?result, "lease release applied");
        Ok(result)
    }
}

fn map_retry_error(operation: &str, lease_id: &LeaseId, err: RetryError<sqlx::Error>) -> LeaseError {
    match err {
        RetryError::Permanent(err) => LeaseError::Storage(describe(operation, &err)),
        RetryError::Exhausted { attempts, .. } => LeaseError::Contended {
            lease_id: lease_id.to_string(),
            attempts,
        },
    }
}
