//! Postgres wiring: connection pool, schema install, error mapping.
//!
//! ## Error Mapping
//!
//! | SQLx error | PostgreSQL code | `SqlFailure` |
//! |------------|-----------------|--------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (serialization failure / deadlock / lock not available) | `40001`, `40P01`, `55P03` | `Contention` |
//! | Database (other) | any | `Storage` |
//! | PoolTimedOut, Io | n/a | `Contention` |
//! | everything else | n/a | `Storage` |
//!
//! `Contention` is retryable; the stores surface it so the worker loop can back
//! off instead of failing a job.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::config::DatabaseConfig;

const SCHEMA: &str = include_str!("../schema/rewardflow.sql");

/// Open the process-wide pool. One pool per process; stores share it by clone.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect(&config.url)
        .await?;
    info!(max_connections = config.max_connections, "connected to postgres");
    Ok(pool)
}

/// Create tables and indexes if they do not exist yet.
pub async fn install_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

/// Storage-agnostic classification of a failed SQL call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SqlFailure {
    Conflict(String),
    Contention(String),
    Storage(String),
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> SqlFailure {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => SqlFailure::Conflict(msg),
                Some("40001") | Some("40P01") | Some("55P03") => SqlFailure::Contention(msg),
                _ => SqlFailure::Storage(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            SqlFailure::Contention(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::Io(e) => SqlFailure::Contention(format!("io error in {}: {}", operation, e)),
        sqlx::Error::PoolClosed => {
            SqlFailure::Storage(format!("connection pool closed in {}", operation))
        }
        other => SqlFailure::Storage(format!("sqlx error in {}: {}", operation, other)),
    }
}
