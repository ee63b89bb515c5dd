//! Read-only status projection over the job store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::retry::to_chrono;
use super::store::{JobStore, JobStoreError, StatusCounts};
use super::types::{Job, JobId, Stage, StatusKind};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub error: u64,
    pub total: u64,
}

impl From<StatusCounts> for StatusSummary {
    fn from(counts: StatusCounts) -> Self {
        Self {
            queued: counts.queued,
            running: counts.running,
            completed: counts.completed,
            error: counts.error,
            total: counts.total(),
        }
    }
}

/// Flattened job row as shown to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: JobId,
    pub correlation_id: String,
    pub trigger_type: String,
    pub stage: Stage,
    pub status: StatusKind,
    pub attempts: u32,
    pub max_attempts: u32,
    pub scheduled_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_owner: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            correlation_id: job.correlation_id.to_string(),
            trigger_type: job.trigger_type.to_string(),
            stage: job.stage,
            status: job.status.kind(),
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            scheduled_at: job.scheduled_at,
            locked_at: job.locked_at(),
            lock_owner: job.lock_owner().map(str::to_string),
            last_error: job.last_error.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub summary: StatusSummary,
    pub stuck_jobs: Vec<JobView>,
    pub recent_queued: Vec<JobView>,
    pub recent_completed: Vec<JobView>,
    pub recent_errors: Vec<JobView>,
}

pub struct StatusProjection {
    store: Arc<dyn JobStore>,
    stuck_threshold: Duration,
}

impl StatusProjection {
    pub fn new(store: Arc<dyn JobStore>, stuck_threshold: Duration) -> Self {
        Self {
            store,
            stuck_threshold,
        }
    }

    /// Snapshot computed on demand; each list holds at most `limit` jobs.
    pub async fn report(&self, limit: usize, now: DateTime<Utc>) -> Result<StatusReport, JobStoreError> {
        let cutoff = now - to_chrono(self.stuck_threshold);
        let views = |jobs: Vec<Job>| jobs.iter().map(JobView::from).collect::<Vec<_>>();

        Ok(StatusReport {
            summary: self.store.counts().await?.into(),
            stuck_jobs: views(self.store.stuck(cutoff, limit).await?),
            recent_queued: views(self.store.recent(StatusKind::Queued, limit).await?),
            recent_completed: views(self.store.recent(StatusKind::Completed, limit).await?),
            recent_errors: views(self.store.recent(StatusKind::Error, limit).await?),
        })
    }
}
