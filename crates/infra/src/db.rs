//! Postgres pool wiring and shared SQLx helpers.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::config::DatabaseConfig;

/// SQLSTATE for `serialization_failure`.
pub(crate) const SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE for `check_violation`.
pub(crate) const CHECK_VIOLATION: &str = "23514";

/// Open a connection pool for the registry database.
pub async fn connect_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.url)
        .await?;

    info!(max_connections = config.max_connections, "database pool connected");
    Ok(pool)
}

/// Apply the embedded schema migrations (lease, import job status, import items).
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// SQLSTATE of a database error, if any.
pub(crate) fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|c| c.into_owned()),
        _ => None,
    }
}

pub(crate) fn is_serialization_failure(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some(SERIALIZATION_FAILURE)
}

pub(crate) fn is_check_violation(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some(CHECK_VIOLATION)
}

/// Render a SQLx error with the operation it came from.
pub(crate) fn describe(operation: &str, err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => {
            format!("database error in {}: {}", operation, db_err.message())
        }
        sqlx::Error::PoolClosed => format!("connection pool closed in {}", operation),
        _ => format!("sqlx error in {}: {}", operation, err),
    }
}

/// Convert a watermark to its BIGINT column representation.
pub(crate) fn to_bigint(value: u64) -> Option<i64> {
    i64::try_from(value).ok()
}

/// Convert a BIGINT column back to a watermark; negative values clamp to zero.
pub(crate) fn from_bigint(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
