//! Claim loop: lease a batch, run each job on its own task, apply failures.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::clock::Clock;
use super::pipeline::{PipelineOutcome, StagePipeline};
use super::retry::{FailureOutcome, RetryController};
use super::store::{JobStore, JobStoreError};
use super::types::Job;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Lease owner written into claimed rows
    pub worker_id: String,
    /// Jobs claimed (and run concurrently) per tick
    pub batch_size: usize,
    /// Sleep between empty or failed polls
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker".to_string(),
            batch_size: 8,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub leases_lost: u64,
    pub current_running: usize,
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub lease_lost: usize,
    /// Jobs whose failure could not be written; their lease will expire.
    pub unrecorded: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobResult {
    Completed,
    Retried,
    DeadLettered,
    LeaseLost,
    Unrecorded,
}

struct WorkerInner {
    store: Arc<dyn JobStore>,
    pipeline: StagePipeline,
    retry: RetryController,
    config: WorkerConfig,
    stats: Mutex<WorkerStats>,
}

/// Cheap to clone; clones share stats.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobStore>,
        pipeline: StagePipeline,
        retry: RetryController,
        config: WorkerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                store,
                pipeline,
                retry,
                config,
                stats: Mutex::new(WorkerStats::default()),
            }),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.config.worker_id
    }

    pub fn stats(&self) -> WorkerStats {
        self.inner
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn update_stats(&self, apply: impl FnOnce(&mut WorkerStats)) {
        if let Ok(mut stats) = self.inner.stats.lock() {
            apply(&mut stats);
        }
    }

    /// Claim one batch with every timestamp pinned to `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport, JobStoreError> {
        self.tick(Clock::Fixed(now)).await
    }

    /// Claim one batch and run it to the end.
    ///
    /// Only claim failures are returned; everything that happens to a claimed
    /// job is turned into a store transition and counted in the report.
    pub async fn tick(&self, clock: Clock) -> Result<TickReport, JobStoreError> {
        let config = &self.inner.config;
        let jobs = self
            .inner
            .store
            .claim(&config.worker_id, config.batch_size, clock.now())
            .await?;

        let mut report = TickReport {
            claimed: jobs.len(),
            ..TickReport::default()
        };
        if jobs.is_empty() {
            return Ok(report);
        }
        debug!(worker = %config.worker_id, claimed = jobs.len(), "claimed jobs");
        self.update_stats(|s| s.current_running += jobs.len());

        let mut tasks = JoinSet::new();
        for job in jobs {
            let worker = self.clone();
            tasks.spawn(async move { worker.process(job, clock).await });
        }

        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!(worker = %config.worker_id, error = %e, "job task panicked");
                    JobResult::Unrecorded
                }
            };
            match result {
                JobResult::Completed => report.completed += 1,
                JobResult::Retried => report.retried += 1,
                JobResult::DeadLettered => report.dead_lettered += 1,
                JobResult::LeaseLost => report.lease_lost += 1,
                JobResult::Unrecorded => report.unrecorded += 1,
            }
            self.update_stats(|s| {
                s.current_running = s.current_running.saturating_sub(1);
                s.jobs_processed += 1;
                match result {
                    JobResult::Completed => s.jobs_completed += 1,
                    JobResult::Retried => s.jobs_retried += 1,
                    JobResult::DeadLettered => s.jobs_dead_lettered += 1,
                    JobResult::LeaseLost => s.leases_lost += 1,
                    JobResult::Unrecorded => {}
                }
            });
        }
        Ok(report)
    }

    async fn process(&self, job: Job, clock: Clock) -> JobResult {
        let owner = self.worker_id();
        let (job, stage, error) = match self.inner.pipeline.execute(job, owner, clock).await {
            PipelineOutcome::Completed(job) => {
                info!(
                    worker = %owner,
                    job_id = %job.id,
                    correlation_id = %job.correlation_id,
                    attempt = job.attempts,
                    "job completed"
                );
                return JobResult::Completed;
            }
            PipelineOutcome::Failed { job, stage, error } => (job, stage, error),
        };

        if error.is_lease_lost() {
            warn!(
                worker = %owner,
                job_id = %job.id,
                correlation_id = %job.correlation_id,
                %stage,
                "lease lost mid-run, abandoning job"
            );
            return JobResult::LeaseLost;
        }

        let reason = format!("{stage}: {error}");
        match self
            .inner
            .retry
            .handle_failure(&job, owner, &reason, error.class(), clock.now())
            .await
        {
            Ok(FailureOutcome::Retrying { .. }) => JobResult::Retried,
            Ok(FailureOutcome::DeadLettered { .. }) => JobResult::DeadLettered,
            Err(JobStoreError::LeaseLost { .. }) => {
                warn!(worker = %owner, job_id = %job.id, "lease lost before failure was recorded");
                JobResult::LeaseLost
            }
            Err(e) => {
                error!(
                    worker = %owner,
                    job_id = %job.id,
                    correlation_id = %job.correlation_id,
                    %stage,
                    error = %e,
                    "failed to record job failure, leaving it to lease expiry"
                );
                JobResult::Unrecorded
            }
        }
    }

    /// Run the claim loop on a tokio task until shut down.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let worker = self.clone();

        let join = tokio::spawn(async move {
            let config = &worker.inner.config;
            info!(worker = %config.worker_id, batch_size = config.batch_size, "worker started");

            while !*shutdown_rx.borrow() {
                let busy = match worker.tick(Clock::System).await {
                    Ok(report) => report.claimed > 0,
                    Err(e) => {
                        error!(worker = %config.worker_id, error = %e, "failed to claim jobs");
                        false
                    }
                };
                if busy {
                    continue;
                }
                tokio::select! {
                    _ = tokio::time::sleep(config.poll_interval) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }

            info!(worker = %config.worker_id, "worker stopped");
        });

        WorkerHandle {
            shutdown: shutdown_tx,
            join,
            worker: self,
        }
    }
}

/// Handle to control a running worker.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    worker: Worker,
}

impl WorkerHandle {
    /// Stop claiming and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "worker task ended abnormally");
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.worker.stats()
    }
}
