//! Postgres-backed job store.
//!
//! ## Enqueue
//!
//! `jobs.correlation_id` is unique. `find_or_enqueue` inserts with
//! `ON CONFLICT (correlation_id) DO NOTHING` and reads the existing row when
//! nothing was written.
//!
//! ## Claiming
//!
//! `claim` is a single `UPDATE … FROM (SELECT … FOR UPDATE SKIP LOCKED)`
//! statement, so concurrent workers never lease the same row and never block
//! on each other's picks.
//!
//! ## Transitions
//!
//! Every other write locks the row (`SELECT … FOR UPDATE`), applies the
//! `Job` state machine in Rust and writes the result back in the same
//! transaction. The SQL layer never re-implements transition rules; the
//! table's CHECK constraints are the backstop.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use rewardflow_events::{CorrelationId, TriggerType};

use crate::db::map_sqlx_error;

use super::document::JobContext;
use super::store::{JobStore, JobStoreError, Placement, StatusCounts, owner_write_error};
use super::types::{Job, JobId, JobStatus, NewJob, Stage, StatusKind, TransitionError};

const COLUMNS: &str = "id, correlation_id, trigger_type, stage, status, payload, context, attempts, \
     max_attempts, scheduled_at, locked_at, lock_owner, last_error, created_at, updated_at";

const INSERT_JOB: &str = "INSERT INTO jobs \
     (id, correlation_id, trigger_type, stage, status, payload, context, attempts, \
     max_attempts, scheduled_at, locked_at, lock_owner, last_error, created_at, updated_at) \
     VALUES ($1, $2, $3, $4, 'queued', $5, $6, 0, $7, $8, NULL, NULL, NULL, $9, $9)";

fn sql_error(operation: &'static str) -> impl Fn(sqlx::Error) -> JobStoreError {
    move |e| JobStoreError::from(map_sqlx_error(operation, e))
}

/// Raw `jobs` row.
#[derive(Debug)]
struct JobRow {
    id: Uuid,
    correlation_id: String,
    trigger_type: String,
    stage: String,
    status: String,
    payload: serde_json::Value,
    context: serde_json::Value,
    attempts: i32,
    max_attempts: i32,
    scheduled_at: DateTime<Utc>,
    locked_at: Option<DateTime<Utc>>,
    lock_owner: Option<String>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            correlation_id: row.try_get("correlation_id")?,
            trigger_type: row.try_get("trigger_type")?,
            stage: row.try_get("stage")?,
            status: row.try_get("status")?,
            payload: row.try_get("payload")?,
            context: row.try_get("context")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            scheduled_at: row.try_get("scheduled_at")?,
            locked_at: row.try_get("locked_at")?,
            lock_owner: row.try_get("lock_owner")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |what: String| JobStoreError::Corrupt(format!("job {}: {what}", row.id));

        let kind = StatusKind::parse(&row.status)
            .ok_or_else(|| corrupt(format!("unknown status {:?}", row.status)))?;
        let status = match (kind, row.locked_at, row.lock_owner.clone()) {
            (StatusKind::Running, Some(leased_at), Some(lease_owner)) => JobStatus::Running {
                lease_owner,
                leased_at,
            },
            (StatusKind::Running, _, _) => return Err(corrupt("running without a lease".into())),
            (_, None, None) => match kind {
                StatusKind::Queued => JobStatus::Queued,
                StatusKind::Completed => JobStatus::Completed,
                _ => JobStatus::Error {
                    reason: row.last_error.clone().unwrap_or_default(),
                },
            },
            _ => return Err(corrupt(format!("lease fields set on a {kind} job"))),
        };

        let stage = Stage::parse(&row.stage)
            .ok_or_else(|| corrupt(format!("unknown stage {:?}", row.stage)))?;
        let attempts = u32::try_from(row.attempts)
            .map_err(|_| corrupt(format!("negative attempts {}", row.attempts)))?;
        let max_attempts = u32::try_from(row.max_attempts)
            .map_err(|_| corrupt(format!("negative max_attempts {}", row.max_attempts)))?;
        let payload = serde_json::from_value(row.payload.clone())
            .map_err(|e| corrupt(format!("payload: {e}")))?;
        let context = serde_json::from_value(row.context.clone())
            .map_err(|e| corrupt(format!("context: {e}")))?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            correlation_id: CorrelationId::from_raw(row.correlation_id),
            trigger_type: TriggerType::new(row.trigger_type),
            stage,
            status,
            payload,
            context,
            attempts,
            max_attempts,
            scheduled_at: row.scheduled_at,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn rows_to_jobs(rows: Vec<JobRow>) -> Result<Vec<Job>, JobStoreError> {
    rows.into_iter().map(Job::try_from).collect()
}

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run an insert statement for `job`. Returns whether a row was written.
    async fn insert(&self, job: &Job, sql: &str, operation: &'static str) -> Result<bool, JobStoreError> {
        let payload = serde_json::to_value(&job.payload)
            .map_err(|e| JobStoreError::Corrupt(format!("payload: {e}")))?;
        let context = serde_json::to_value(&job.context)
            .map_err(|e| JobStoreError::Corrupt(format!("context: {e}")))?;

        let result = sqlx::query(sql)
            .bind(job.id.as_uuid())
            .bind(job.correlation_id.as_str())
            .bind(job.trigger_type.as_str())
            .bind(job.stage.as_str())
            .bind(payload)
            .bind(context)
            .bind(job.max_attempts as i32)
            .bind(job.scheduled_at)
            .bind(job.created_at)
            .execute(&self.pool)
            .await
            .map_err(sql_error(operation))?;
        Ok(result.rows_affected() == 1)
    }

    /// Lock one row, apply an owner-checked transition, write it back.
    async fn transition<F>(&self, operation: &'static str, id: JobId, apply: F) -> Result<Job, JobStoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), TransitionError> + Send,
    {
        let mut tx = self.pool.begin().await.map_err(sql_error(operation))?;

        let row: Option<JobRow> = sqlx::query_as(
            "SELECT id, correlation_id, trigger_type, stage, status, payload, context, attempts, \
             max_attempts, scheduled_at, locked_at, lock_owner, last_error, created_at, updated_at \
             FROM jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(sql_error(operation))?;

        let mut job = Job::try_from(row.ok_or(JobStoreError::NotFound(id))?)?;
        apply(&mut job).map_err(|e| owner_write_error(id, e))?;
        write_back(&mut tx, &job, operation).await?;
        tx.commit().await.map_err(sql_error(operation))?;
        Ok(job)
    }

    /// Lock every row matched by `select` (with `$1 = bound` when given),
    /// apply `apply`, write them back.
    async fn transition_matching<F>(
        &self,
        operation: &'static str,
        select: &'static str,
        bound: Option<DateTime<Utc>>,
        apply: F,
    ) -> Result<Vec<Job>, JobStoreError>
    where
        F: Fn(&mut Job) -> Result<(), TransitionError> + Send,
    {
        let mut tx = self.pool.begin().await.map_err(sql_error(operation))?;

        let mut query = sqlx::query_as::<_, JobRow>(select);
        if let Some(bound) = bound {
            query = query.bind(bound);
        }
        let rows = query
            .fetch_all(&mut *tx)
            .await
            .map_err(sql_error(operation))?;

        let mut jobs = rows_to_jobs(rows)?;
        for job in &mut jobs {
            apply(job)?;
            write_back(&mut tx, job, operation).await?;
        }
        tx.commit().await.map_err(sql_error(operation))?;
        Ok(jobs)
    }
}

/// Persist the mutable columns of `job`.
async fn write_back(
    tx: &mut Transaction<'_, Postgres>,
    job: &Job,
    operation: &'static str,
) -> Result<(), JobStoreError> {
    let context = serde_json::to_value(&job.context)
        .map_err(|e| JobStoreError::Corrupt(format!("context: {e}")))?;
    sqlx::query(
        r#"
        UPDATE jobs
        SET stage = $2, status = $3, context = $4, attempts = $5, scheduled_at = $6,
            locked_at = $7, lock_owner = $8, last_error = $9, updated_at = $10
        WHERE id = $1
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.stage.as_str())
    .bind(job.status.kind().as_str())
    .bind(context)
    .bind(job.attempts as i32)
    .bind(job.scheduled_at)
    .bind(job.locked_at())
    .bind(job.lock_owner())
    .bind(job.last_error.as_deref())
    .bind(job.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(sql_error(operation))?;
    Ok(())
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(correlation_id = %job.correlation_id), err)]
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let job = job.into_job(now);
        self.insert(&job, INSERT_JOB, "jobs.enqueue").await?;
        debug!(job_id = %job.id, "job enqueued");
        Ok(job)
    }

    #[instrument(skip(self, job), fields(correlation_id = %job.correlation_id), err)]
    async fn find_or_enqueue(&self, job: NewJob, now: DateTime<Utc>) -> Result<Placement, JobStoreError> {
        let job = job.into_job(now);
        let sql = format!("{INSERT_JOB} ON CONFLICT (correlation_id) DO NOTHING");
        if self.insert(&job, &sql, "jobs.find_or_enqueue").await? {
            debug!(job_id = %job.id, "job enqueued");
            return Ok(Placement::Created(job));
        }
        // Lost the insert race; the winner's row is committed.
        self.find_by_correlation(&job.correlation_id)
            .await?
            .map(Placement::Existing)
            .ok_or_else(|| {
                JobStoreError::Conflict(format!(
                    "correlation id {} conflicted but has no job",
                    job.correlation_id
                ))
            })
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row: Option<JobRow> = sqlx::query_as(&format!("SELECT {COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_error("jobs.get"))?;
        row.map(Job::try_from).transpose()
    }

    #[instrument(skip(self), err)]
    async fn find_by_correlation(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Option<Job>, JobStoreError> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM jobs WHERE correlation_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        ))
        .bind(correlation_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(sql_error("jobs.find_by_correlation"))?;
        row.map(Job::try_from).transpose()
    }

    #[instrument(skip(self), err)]
    async fn claim(
        &self,
        worker_id: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            WITH picked AS (
                SELECT id
                FROM jobs
                WHERE status = 'queued'
                  AND scheduled_at <= $1
                  AND attempts < max_attempts
                ORDER BY scheduled_at, created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs j
            SET status = 'running',
                locked_at = $1,
                lock_owner = $3,
                attempts = j.attempts + 1,
                updated_at = $1
            FROM picked
            WHERE j.id = picked.id
            RETURNING j.*
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(sql_error("jobs.claim"))?;

        // RETURNING does not preserve the pick order.
        let mut jobs = rows_to_jobs(rows)?;
        jobs.sort_by(|a, b| (a.scheduled_at, a.created_at).cmp(&(b.scheduled_at, b.created_at)));
        Ok(jobs)
    }

    #[instrument(skip(self, context), fields(job_id = %id, stage = %next), err)]
    async fn commit_stage(
        &self,
        id: JobId,
        owner: &str,
        next: Stage,
        context: &JobContext,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let context = context.clone();
        self.transition("jobs.commit_stage", id, move |job| {
            job.commit_stage(owner, next, context, now)
        })
        .await
    }

    #[instrument(skip(self, context), fields(job_id = %id), err)]
    async fn complete(
        &self,
        id: JobId,
        owner: &str,
        context: &JobContext,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let context = context.clone();
        self.transition("jobs.complete", id, move |job| job.complete(owner, context, now))
            .await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn requeue(
        &self,
        id: JobId,
        owner: &str,
        at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        self.transition("jobs.requeue", id, |job| job.requeue(owner, at, error, now))
            .await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn fail(
        &self,
        id: JobId,
        owner: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        self.transition("jobs.fail", id, |job| job.fail(owner, error, now))
            .await
    }

    #[instrument(skip(self), err)]
    async fn reclaim_expired(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        self.transition_matching(
            "jobs.reclaim_expired",
            "SELECT id, correlation_id, trigger_type, stage, status, payload, context, attempts, \
             max_attempts, scheduled_at, locked_at, lock_owner, last_error, created_at, updated_at \
             FROM jobs WHERE status = 'running' AND locked_at <= $1 \
             ORDER BY locked_at FOR UPDATE SKIP LOCKED",
            Some(cutoff),
            |job| job.reclaim(now),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn fail_exhausted_queued(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        self.transition_matching(
            "jobs.fail_exhausted_queued",
            "SELECT id, correlation_id, trigger_type, stage, status, payload, context, attempts, \
             max_attempts, scheduled_at, locked_at, lock_owner, last_error, created_at, updated_at \
             FROM jobs WHERE status = 'queued' AND attempts >= max_attempts \
             FOR UPDATE SKIP LOCKED",
            None,
            |job| job.expire_exhausted(now),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn counts(&self) -> Result<StatusCounts, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(sql_error("jobs.counts"))?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(sql_error("jobs.counts"))?;
            let n: i64 = row.try_get("n").map_err(sql_error("jobs.counts"))?;
            let kind = StatusKind::parse(&status)
                .ok_or_else(|| JobStoreError::Corrupt(format!("unknown status {status:?}")))?;
            counts.add(kind, n.max(0) as u64);
        }
        Ok(counts)
    }

    #[instrument(skip(self), err)]
    async fn recent(&self, status: StatusKind, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM jobs WHERE status = $1 ORDER BY updated_at DESC, id DESC LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(sql_error("jobs.recent"))?;
        rows_to_jobs(rows)
    }

    #[instrument(skip(self), err)]
    async fn stuck(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM jobs WHERE status = 'running' AND locked_at <= $1 \
             ORDER BY locked_at, id LIMIT $2"
        ))
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(sql_error("jobs.stuck"))?;
        rows_to_jobs(rows)
    }

    #[instrument(skip(self), err)]
    async fn reset_errors(&self, now: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', attempts = 0, last_error = NULL,
                locked_at = NULL, lock_owner = NULL,
                scheduled_at = GREATEST($1, created_at), updated_at = $1
            WHERE status = 'error'
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(sql_error("jobs.reset_errors"))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn reset_stuck(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', last_error = NULL,
                locked_at = NULL, lock_owner = NULL,
                scheduled_at = GREATEST($2, created_at), updated_at = $2
            WHERE status = 'running' AND locked_at <= $1
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(sql_error("jobs.reset_stuck"))?;
        Ok(result.rows_affected())
    }
}
