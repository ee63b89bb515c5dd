//! Append-only record of jobs that ended in `error`.

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Row};
use tracing::{error, instrument};
use uuid::Uuid;

use crate::db::{SqlFailure, map_sqlx_error};

use super::document::JobPayload;
use super::types::{Job, JobId};

/// Snapshot of a job at the moment it was given up on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub job_id: JobId,
    pub correlation_id: String,
    pub trigger_type: String,
    pub payload: JobPayload,
    pub error: String,
    /// Attempts used when the job failed.
    pub attempts: u32,
    pub job_created_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn from_job(job: &Job, error: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id: job.id,
            correlation_id: job.correlation_id.to_string(),
            trigger_type: job.trigger_type.to_string(),
            payload: job.payload.clone(),
            error: error.to_string(),
            attempts: job.attempts,
            job_created_at: job.created_at,
            dead_lettered_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeadLetterError {
    #[error("dead-letter storage error: {0}")]
    Storage(String),
    #[error("corrupt dead-letter row: {0}")]
    Corrupt(String),
}

impl From<SqlFailure> for DeadLetterError {
    fn from(failure: SqlFailure) -> Self {
        match failure {
            SqlFailure::Conflict(msg) | SqlFailure::Contention(msg) | SqlFailure::Storage(msg) => {
                DeadLetterError::Storage(msg)
            }
        }
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, entry: DeadLetterEntry) -> Result<(), DeadLetterError>;

    /// Newest entries first.
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, DeadLetterError>;
}

/// Record without failing the caller; the job transition has already
/// happened and must not be undone by a sink outage.
pub async fn record_best_effort(sink: &dyn DeadLetterSink, entry: DeadLetterEntry) {
    let job_id = entry.job_id;
    let correlation_id = entry.correlation_id.clone();
    if let Err(e) = sink.record(entry).await {
        error!(
            %job_id,
            %correlation_id,
            error = %e,
            "failed to record dead letter"
        );
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDeadLetterSink {
    entries: RwLock<Vec<DeadLetterEntry>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn record(&self, entry: DeadLetterEntry) -> Result<(), DeadLetterError> {
        self.entries
            .write()
            .map_err(|_| DeadLetterError::Storage("dead-letter lock poisoned".to_string()))?
            .push(entry);
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| DeadLetterError::Storage("dead-letter lock poisoned".to_string()))?;
        Ok(entries.iter().rev().take(limit).cloned().collect())
    }
}

#[derive(Debug, Clone)]
pub struct PostgresDeadLetterSink {
    pool: PgPool,
}

impl PostgresDeadLetterSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterSink for PostgresDeadLetterSink {
    #[instrument(skip(self, entry), fields(job_id = %entry.job_id), err)]
    async fn record(&self, entry: DeadLetterEntry) -> Result<(), DeadLetterError> {
        let payload = serde_json::to_value(&entry.payload)
            .map_err(|e| DeadLetterError::Corrupt(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO dead_letters
                (id, job_id, correlation_id, trigger_type, payload, error, attempts,
                 job_created_at, dead_lettered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(entry.job_id.as_uuid())
        .bind(&entry.correlation_id)
        .bind(&entry.trigger_type)
        .bind(payload)
        .bind(&entry.error)
        .bind(entry.attempts as i32)
        .bind(entry.job_created_at)
        .bind(entry.dead_lettered_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("dead_letters.record", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, correlation_id, trigger_type, payload, error, attempts,
                   job_created_at, dead_lettered_at
            FROM dead_letters
            ORDER BY dead_lettered_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("dead_letters.list", e))?;

        rows.into_iter()
            .map(|row| {
                let decode = |e: sqlx::Error| DeadLetterError::Corrupt(e.to_string());
                let payload: serde_json::Value = row.try_get("payload").map_err(decode)?;
                let attempts: i32 = row.try_get("attempts").map_err(decode)?;
                Ok(DeadLetterEntry {
                    id: row.try_get("id").map_err(decode)?,
                    job_id: JobId::from_uuid(row.try_get("job_id").map_err(decode)?),
                    correlation_id: row.try_get("correlation_id").map_err(decode)?,
                    trigger_type: row.try_get("trigger_type").map_err(decode)?,
                    payload: serde_json::from_value(payload)
                        .map_err(|e| DeadLetterError::Corrupt(e.to_string()))?,
                    error: row.try_get("error").map_err(decode)?,
                    attempts: u32::try_from(attempts)
                        .map_err(|_| DeadLetterError::Corrupt(format!("negative attempts {attempts}")))?,
                    job_created_at: row.try_get("job_created_at").map_err(decode)?,
                    dead_lettered_at: row.try_get("dead_lettered_at").map_err(decode)?,
                })
            })
            .collect()
    }
}
