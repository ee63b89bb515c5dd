//! Per-delivery run records keyed by the inbound event id.
//!
//! A run answers "have we seen this delivery?"; it never drives retries.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use rewardflow_core::JobId;
use rewardflow_events::CorrelationId;

use crate::db::{SqlFailure, map_sqlx_error};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub event_id: String,
    pub correlation_id: CorrelationId,
    pub event_type: String,
    /// Job this delivery produced or converged on.
    pub job_id: Option<JobId>,
    pub received_at: DateTime<Utc>,
}

impl Run {
    pub fn new(
        event_id: impl Into<String>,
        correlation_id: CorrelationId,
        event_type: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            correlation_id,
            event_type: event_type.into(),
            job_id: None,
            received_at,
        }
    }
}

/// Result of recording a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunRecord {
    /// First time this event id was seen.
    Inserted(Run),
    /// The event id was already recorded; the stored run is returned.
    Existing(Run),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunStoreError {
    #[error("run not found: {0}")]
    NotFound(String),
    #[error("run store contention: {0}")]
    Contention(String),
    #[error("run storage error: {0}")]
    Storage(String),
}

impl From<SqlFailure> for RunStoreError {
    fn from(failure: SqlFailure) -> Self {
        match failure {
            SqlFailure::Contention(msg) => RunStoreError::Contention(msg),
            SqlFailure::Conflict(msg) | SqlFailure::Storage(msg) => RunStoreError::Storage(msg),
        }
    }
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert the run unless its event id is already known.
    async fn record(&self, run: Run) -> Result<RunRecord, RunStoreError>;

    /// Link (or re-link) a run to a job.
    async fn attach_job(&self, event_id: &str, job_id: JobId) -> Result<(), RunStoreError>;

    async fn get(&self, event_id: &str) -> Result<Option<Run>, RunStoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<String, Run>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> RunStoreError {
    RunStoreError::Storage("run map lock poisoned".to_string())
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn record(&self, run: Run) -> Result<RunRecord, RunStoreError> {
        let mut runs = self.runs.write().map_err(poisoned)?;
        if let Some(existing) = runs.get(&run.event_id) {
            return Ok(RunRecord::Existing(existing.clone()));
        }
        runs.insert(run.event_id.clone(), run.clone());
        Ok(RunRecord::Inserted(run))
    }

    async fn attach_job(&self, event_id: &str, job_id: JobId) -> Result<(), RunStoreError> {
        let mut runs = self.runs.write().map_err(poisoned)?;
        let run = runs
            .get_mut(event_id)
            .ok_or_else(|| RunStoreError::NotFound(event_id.to_string()))?;
        run.job_id = Some(job_id);
        Ok(())
    }

    async fn get(&self, event_id: &str) -> Result<Option<Run>, RunStoreError> {
        Ok(self.runs.read().map_err(poisoned)?.get(event_id).cloned())
    }
}

#[derive(Debug, Clone)]
pub struct PostgresRunStore {
    pool: PgPool,
}

impl PostgresRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn run_from_row(row: &PgRow) -> Result<Run, RunStoreError> {
    let decode = |e: sqlx::Error| RunStoreError::Storage(format!("decode run: {e}"));
    let job_id: Option<Uuid> = row.try_get("job_id").map_err(decode)?;
    let correlation: String = row.try_get("correlation_id").map_err(decode)?;
    Ok(Run {
        event_id: row.try_get("event_id").map_err(decode)?,
        correlation_id: CorrelationId::from_raw(correlation),
        event_type: row.try_get("event_type").map_err(decode)?,
        job_id: job_id.map(JobId::from_uuid),
        received_at: row.try_get("received_at").map_err(decode)?,
    })
}

#[async_trait]
impl RunStore for PostgresRunStore {
    #[instrument(skip(self, run), fields(event_id = %run.event_id), err)]
    async fn record(&self, run: Run) -> Result<RunRecord, RunStoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO runs (event_id, correlation_id, event_type, job_id, received_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING event_id
            "#,
        )
        .bind(&run.event_id)
        .bind(run.correlation_id.as_str())
        .bind(&run.event_type)
        .bind(run.job_id.map(Uuid::from))
        .bind(run.received_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("runs.record", e))?;

        if inserted.is_some() {
            return Ok(RunRecord::Inserted(run));
        }

        let existing = self
            .get(&run.event_id)
            .await?
            .ok_or_else(|| RunStoreError::NotFound(run.event_id.clone()))?;
        Ok(RunRecord::Existing(existing))
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn attach_job(&self, event_id: &str, job_id: JobId) -> Result<(), RunStoreError> {
        let result = sqlx::query("UPDATE runs SET job_id = $2 WHERE event_id = $1")
            .bind(event_id)
            .bind(job_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("runs.attach_job", e))?;
        if result.rows_affected() == 0 {
            return Err(RunStoreError::NotFound(event_id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get(&self, event_id: &str) -> Result<Option<Run>, RunStoreError> {
        let row = sqlx::query(
            "SELECT event_id, correlation_id, event_type, job_id, received_at FROM runs WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("runs.get", e))?;
        row.as_ref().map(run_from_row).transpose()
    }
}
