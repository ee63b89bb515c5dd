//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use rewardflow_events::CorrelationId;

use crate::db::SqlFailure;

use super::document::JobContext;
use super::types::{Job, JobId, JobStatus, NewJob, Stage, StatusKind, TransitionError};

/// Job store abstraction.
///
/// Owner-checked writes (`commit_stage`, `complete`, `requeue`, `fail`) return
/// [`JobStoreError::LeaseLost`] when the row is no longer running under the
/// caller's lease, e.g. because the reaper reclaimed it.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a queued job. A second job for the same correlation id is a
    /// [`JobStoreError::Conflict`].
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, JobStoreError>;

    /// Insert `job` unless its correlation id already has one, in one atomic
    /// step: concurrent callers for a correlation id end up with one job.
    async fn find_or_enqueue(&self, job: NewJob, now: DateTime<Utc>) -> Result<Placement, JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Most recently created job for a correlation id.
    async fn find_by_correlation(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Atomically lease up to `limit` claimable jobs to `worker_id`.
    async fn claim(
        &self,
        worker_id: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Persist a stage's output and advance to `next`.
    async fn commit_stage(
        &self,
        id: JobId,
        owner: &str,
        next: Stage,
        context: &JobContext,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// Persist the last stage's output and mark the job completed.
    async fn complete(
        &self,
        id: JobId,
        owner: &str,
        context: &JobContext,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// Release the lease and schedule another attempt at `at`.
    async fn requeue(
        &self,
        id: JobId,
        owner: &str,
        at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// Release the lease and move to `error`.
    async fn fail(
        &self,
        id: JobId,
        owner: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// Reclaim running jobs whose lease was taken at or before `cutoff`.
    /// Returns the rows after the transition (queued, or error when the
    /// final attempt expired).
    async fn reclaim_expired(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Move queued jobs without attempts left to `error`.
    async fn fail_exhausted_queued(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError>;

    async fn counts(&self) -> Result<StatusCounts, JobStoreError>;

    /// Most recently updated jobs in a status.
    async fn recent(&self, status: StatusKind, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Running jobs leased at or before `cutoff`, oldest lease first.
    async fn stuck(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Re-queue every error job with attempts reset. Returns the count.
    async fn reset_errors(&self, now: DateTime<Utc>) -> Result<u64, JobStoreError>;

    /// Re-queue running jobs leased at or before `cutoff`, attempts kept.
    async fn reset_stuck(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>)
    -> Result<u64, JobStoreError>;
}

/// Result of [`JobStore::find_or_enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub enum Placement {
    /// No job had the correlation id; this one was inserted.
    Created(Job),
    /// The correlation id already had a job, returned untouched.
    Existing(Job),
}

impl Placement {
    pub fn job(&self) -> &Job {
        match self {
            Placement::Created(job) | Placement::Existing(job) => job,
        }
    }
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("lease on job {job_id} is no longer held by this worker")]
    LeaseLost { job_id: JobId },
    #[error("transition rejected: {0}")]
    Transition(#[from] TransitionError),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("contention: {0}")]
    Contention(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    /// Transient failure; the operation may succeed if tried again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobStoreError::Contention(_))
    }
}

impl From<SqlFailure> for JobStoreError {
    fn from(failure: SqlFailure) -> Self {
        match failure {
            SqlFailure::Conflict(msg) => JobStoreError::Conflict(msg),
            SqlFailure::Contention(msg) => JobStoreError::Contention(msg),
            SqlFailure::Storage(msg) => JobStoreError::Storage(msg),
        }
    }
}

/// Job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub error: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.queued + self.running + self.completed + self.error
    }

    pub(crate) fn add(&mut self, kind: StatusKind, n: u64) {
        match kind {
            StatusKind::Queued => self.queued += n,
            StatusKind::Running => self.running += n,
            StatusKind::Completed => self.completed += n,
            StatusKind::Error => self.error += n,
        }
    }
}

/// Map a state machine refusal on an owner-checked write.
pub(crate) fn owner_write_error(id: JobId, err: TransitionError) -> JobStoreError {
    match err {
        TransitionError::NotLeaseOwner { .. } => JobStoreError::LeaseLost { job_id: id },
        other => JobStoreError::Transition(other),
    }
}

/// In-memory job store for tests/dev.
///
/// The write lock is held across select and update, which makes `claim`
/// atomic with respect to every other caller.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job map lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job map lock poisoned".to_string()))
    }

    /// Apply an owner-checked transition to one job.
    fn with_owned_job<F>(&self, id: JobId, apply: F) -> Result<Job, JobStoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), TransitionError>,
    {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        // Transitions never mutate on error, so the row is left as it was.
        apply(job).map_err(|e| owner_write_error(id, e))?;
        Ok(job.clone())
    }
}

fn latest_for<'a>(jobs: &'a HashMap<JobId, Job>, correlation_id: &CorrelationId) -> Option<&'a Job> {
    jobs.values()
        .filter(|j| &j.correlation_id == correlation_id)
        .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
}

fn newest_first(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let mut jobs = self.write()?;
        if latest_for(&jobs, &job.correlation_id).is_some() {
            return Err(JobStoreError::Conflict(format!(
                "correlation id {} already has a job",
                job.correlation_id
            )));
        }
        let job = job.into_job(now);
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn find_or_enqueue(&self, job: NewJob, now: DateTime<Utc>) -> Result<Placement, JobStoreError> {
        let mut jobs = self.write()?;
        if let Some(existing) = latest_for(&jobs, &job.correlation_id) {
            return Ok(Placement::Existing(existing.clone()));
        }
        let job = job.into_job(now);
        jobs.insert(job.id, job.clone());
        Ok(Placement::Created(job))
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn find_by_correlation(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.read()?;
        Ok(latest_for(&jobs, correlation_id).cloned())
    }

    async fn claim(
        &self,
        worker_id: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs = self.write()?;

        let mut candidates: Vec<(DateTime<Utc>, DateTime<Utc>, JobId)> = jobs
            .values()
            .filter(|j| j.is_claimable(now))
            .map(|j| (j.scheduled_at, j.created_at, j.id))
            .collect();
        candidates.sort();

        let mut claimed = Vec::with_capacity(limit.min(candidates.len()));
        for (_, _, id) in candidates.into_iter().take(limit) {
            if let Some(job) = jobs.get_mut(&id) {
                job.claim(worker_id, now)?;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn commit_stage(
        &self,
        id: JobId,
        owner: &str,
        next: Stage,
        context: &JobContext,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        self.with_owned_job(id, |job| job.commit_stage(owner, next, context.clone(), now))
    }

    async fn complete(
        &self,
        id: JobId,
        owner: &str,
        context: &JobContext,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        self.with_owned_job(id, |job| job.complete(owner, context.clone(), now))
    }

    async fn requeue(
        &self,
        id: JobId,
        owner: &str,
        at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        self.with_owned_job(id, |job| job.requeue(owner, at, error, now))
    }

    async fn fail(
        &self,
        id: JobId,
        owner: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        self.with_owned_job(id, |job| job.fail(owner, error, now))
    }

    async fn reclaim_expired(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs = self.write()?;
        let mut reclaimed = Vec::new();
        for job in jobs.values_mut().filter(|j| j.lease_expired(cutoff)) {
            job.reclaim(now)?;
            reclaimed.push(job.clone());
        }
        Ok(reclaimed)
    }

    async fn fail_exhausted_queued(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs = self.write()?;
        let mut failed = Vec::new();
        for job in jobs
            .values_mut()
            .filter(|j| matches!(j.status, JobStatus::Queued) && j.attempts_exhausted())
        {
            job.expire_exhausted(now)?;
            failed.push(job.clone());
        }
        Ok(failed)
    }

    async fn counts(&self) -> Result<StatusCounts, JobStoreError> {
        let jobs = self.read()?;
        let mut counts = StatusCounts::default();
        for job in jobs.values() {
            counts.add(job.status.kind(), 1);
        }
        Ok(counts)
    }

    async fn recent(&self, status: StatusKind, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read()?;
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|j| j.status.kind() == status)
            .cloned()
            .collect();
        newest_first(&mut matching);
        matching.truncate(limit);
        Ok(matching)
    }

    async fn stuck(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read()?;
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|j| j.lease_expired(cutoff))
            .cloned()
            .collect();
        matching.sort_by_key(|j| (j.locked_at(), j.id));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn reset_errors(&self, now: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let mut jobs = self.write()?;
        let mut count = 0;
        for job in jobs
            .values_mut()
            .filter(|j| j.status.kind() == StatusKind::Error)
        {
            job.reset_error(now)?;
            count += 1;
        }
        Ok(count)
    }

    async fn reset_stuck(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let mut jobs = self.write()?;
        let mut count = 0;
        for job in jobs.values_mut().filter(|j| j.lease_expired(cutoff)) {
            job.reset_stuck(now)?;
            count += 1;
        }
        Ok(count)
    }
}
