//! Returns abandoned leases to the queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::dead_letter::{DeadLetterEntry, DeadLetterSink, record_best_effort};
use super::retry::to_chrono;
use super::store::{JobStore, JobStoreError};
use super::types::{Job, StatusKind};

/// Result of one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Expired leases put back in the queue
    pub reclaimed: usize,
    /// Expired leases that had used their final attempt
    pub expired_final: usize,
    /// Queued jobs with no attempts left
    pub exhausted_queued: usize,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Clone)]
pub struct Reaper {
    store: Arc<dyn JobStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    lease_timeout: Duration,
    interval: Duration,
}

impl Reaper {
    pub fn new(
        store: Arc<dyn JobStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
        lease_timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            dead_letters,
            lease_timeout,
            interval,
        }
    }

    /// One pass at `now`: reclaim leases taken at or before
    /// `now - lease_timeout`, then expire queued jobs without attempts left.
    pub async fn reap_at(&self, now: DateTime<Utc>) -> Result<ReapReport, JobStoreError> {
        let cutoff = now - to_chrono(self.lease_timeout);
        let mut report = ReapReport::default();

        for job in self.store.reclaim_expired(cutoff, now).await? {
            if job.status.kind() == StatusKind::Error {
                report.expired_final += 1;
                warn!(
                    job_id = %job.id,
                    correlation_id = %job.correlation_id,
                    stage = %job.stage,
                    attempt = job.attempts,
                    "lease expired on final attempt, job moved to error"
                );
                self.dead_letter(&job, now).await;
            } else {
                report.reclaimed += 1;
                info!(
                    job_id = %job.id,
                    correlation_id = %job.correlation_id,
                    stage = %job.stage,
                    attempt = job.attempts,
                    "expired lease reclaimed"
                );
            }
        }

        for job in self.store.fail_exhausted_queued(now).await? {
            report.exhausted_queued += 1;
            warn!(
                job_id = %job.id,
                correlation_id = %job.correlation_id,
                attempt = job.attempts,
                "queued job has no attempts left, moved to error"
            );
            self.dead_letter(&job, now).await;
        }

        Ok(report)
    }

    async fn dead_letter(&self, job: &Job, now: DateTime<Utc>) {
        let reason = job.last_error.as_deref().unwrap_or("attempts exhausted");
        record_best_effort(
            self.dead_letters.as_ref(),
            DeadLetterEntry::from_job(job, reason, now),
        )
        .await;
    }

    pub fn spawn(self) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            info!(
                lease_timeout_secs = self.lease_timeout.as_secs(),
                interval_secs = self.interval.as_secs(),
                "reaper started"
            );
            while !*shutdown_rx.borrow() {
                match self.reap_at(Utc::now()).await {
                    Ok(report) if !report.is_empty() => {
                        info!(
                            reclaimed = report.reclaimed,
                            expired_final = report.expired_final,
                            exhausted_queued = report.exhausted_queued,
                            "reaper pass"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "reaper pass failed"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
            info!("reaper stopped");
        });

        ReaperHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "reaper task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::dead_letter::InMemoryDeadLetterSink;
    use crate::jobs::document::JobContext;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::tests::new_job;
    use crate::jobs::types::{JobStatus, NewJob, Stage};

    const LEASE: Duration = Duration::from_secs(5 * 60);

    fn reaper() -> (Arc<InMemoryJobStore>, Arc<InMemoryDeadLetterSink>, Reaper) {
        let store = Arc::new(InMemoryJobStore::new());
        let sink = Arc::new(InMemoryDeadLetterSink::new());
        let reaper = Reaper::new(store.clone(), sink.clone(), LEASE, Duration::from_secs(30));
        (store, sink, reaper)
    }

    async fn claimed(store: &InMemoryJobStore, max_attempts: u32, at: DateTime<Utc>) -> Job {
        let t = new_job(max_attempts, at);
        store
            .enqueue(NewJob::new(t.correlation_id, t.trigger_type, t.payload, max_attempts), at)
            .await
            .unwrap();
        store.claim("w1", 1, at).await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn abandoned_lease_is_reclaimed_after_timeout() {
        let (store, sink, reaper) = reaper();
        let t0 = Utc::now();
        let job = claimed(&store, 3, t0).await;
        store
            .commit_stage(job.id, "w1", Stage::IssueInstrument, &JobContext::default(), t0)
            .await
            .unwrap();

        let early = reaper.reap_at(t0 + chrono::Duration::minutes(4)).await.unwrap();
        assert!(early.is_empty());

        let at = t0 + chrono::Duration::minutes(5);
        let report = reaper.reap_at(at).await.unwrap();
        assert_eq!(report.reclaimed, 1);

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.locked_at(), None);
        assert_eq!(stored.stage, Stage::IssueInstrument);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.scheduled_at, at);
        assert!(sink.list(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn final_attempt_expiry_is_dead_lettered() {
        let (store, sink, reaper) = reaper();
        let t0 = Utc::now();
        let job = claimed(&store, 1, t0).await;

        let report = reaper
            .reap_at(t0 + chrono::Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(report.expired_final, 1);
        assert_eq!(report.reclaimed, 0);

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status.kind(), StatusKind::Error);
        let letters = sink.list(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].error, "lease expired after final attempt");
    }

    #[tokio::test]
    async fn stuck_reset_on_final_attempt_is_expired() {
        let (store, sink, reaper) = reaper();
        let t0 = Utc::now();
        let job = claimed(&store, 1, t0).await;

        assert_eq!(store.reset_stuck(t0, t0).await.unwrap(), 1);
        let stranded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stranded.status, JobStatus::Queued);
        assert_eq!(stranded.attempts, 1);
        assert!(store.claim("w2", 1, t0).await.unwrap().is_empty());

        let report = reaper.reap_at(t0).await.unwrap();
        assert_eq!(
            report,
            ReapReport {
                reclaimed: 0,
                expired_final: 0,
                exhausted_queued: 1,
            }
        );

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status.kind(), StatusKind::Error);
        assert_eq!(stored.last_error.as_deref(), Some("attempts exhausted while queued"));
        let letters = sink.list(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].job_id, job.id);
        assert_eq!(letters[0].error, "attempts exhausted while queued");

        assert!(reaper.reap_at(t0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn spawned_reaper_stops_on_shutdown() {
        let (_store, _sink, reaper) = reaper();
        let handle = reaper.spawn();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.shutdown().await;
    }
}
