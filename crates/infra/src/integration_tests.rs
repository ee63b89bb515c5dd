//! Integration tests for the full reward flow on in-memory stores.
//!
//! Tests: TriggerEvent → Enqueuer → Worker (pipeline + retry) → Reaper → status / reset
//!
//! Verifies:
//! - A delivered event ends as exactly one completed job
//! - Retries back off and stop at `max_attempts`
//! - Redelivery and crashes never issue a second instrument
//! - Abandoned leases are reclaimed and resumed

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{DateTime, Utc};

    use rewardflow_core::TenantId;
    use rewardflow_events::{Recipient, TriggerEvent};

    use crate::config::default_programs;
    use crate::jobs::{
        DeadLetterSink, EnqueueOutcome, Enqueuer, InMemoryDeadLetterSink, InMemoryJobStore,
        JobAdmin, JobStatus, JobStore, Reaper, ResetFilter, RetryController, RetryPolicy, Stage,
        StagePipeline, StatusKind, StatusProjection, Worker, WorkerConfig,
    };
    use crate::providers::ProviderError;
    use crate::providers::memory::{
        InMemoryNotificationProvider, InMemoryRewardProvider, InMemoryTenantResolver,
    };
    use crate::runs::{InMemoryRunStore, RunStore};

    const LEASE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

    struct Rig {
        jobs: Arc<InMemoryJobStore>,
        runs: Arc<InMemoryRunStore>,
        dead_letters: Arc<InMemoryDeadLetterSink>,
        rewards: Arc<InMemoryRewardProvider>,
        notifier: Arc<InMemoryNotificationProvider>,
        resolver: Arc<InMemoryTenantResolver>,
        enqueuer: Enqueuer,
        reaper: Reaper,
        status: StatusProjection,
        admin: JobAdmin,
    }

    impl Rig {
        fn new(resolver: InMemoryTenantResolver) -> Self {
            let jobs = Arc::new(InMemoryJobStore::new());
            let runs = Arc::new(InMemoryRunStore::new());
            let dead_letters = Arc::new(InMemoryDeadLetterSink::new());
            Self {
                enqueuer: Enqueuer::new(jobs.clone(), runs.clone(), default_programs(), 3),
                reaper: Reaper::new(
                    jobs.clone(),
                    dead_letters.clone(),
                    LEASE_TIMEOUT,
                    Duration::from_secs(30),
                ),
                status: StatusProjection::new(jobs.clone(), LEASE_TIMEOUT),
                admin: JobAdmin::new(jobs.clone(), LEASE_TIMEOUT),
                jobs,
                runs,
                dead_letters,
                rewards: Arc::new(InMemoryRewardProvider::new()),
                notifier: Arc::new(InMemoryNotificationProvider::new()),
                resolver: Arc::new(resolver),
            }
        }

        fn with_fallback_tenant() -> Self {
            Self::new(InMemoryTenantResolver::with_fallback(TenantId::new()))
        }

        fn worker(&self, id: &str) -> Worker {
            let pipeline = StagePipeline::standard(
                self.jobs.clone(),
                self.resolver.clone(),
                self.rewards.clone(),
                self.notifier.clone(),
            );
            let retry = RetryController::new(
                self.jobs.clone(),
                self.dead_letters.clone(),
                RetryPolicy::exponential(3, Duration::from_secs(2), Duration::from_secs(60)),
            );
            Worker::new(
                self.jobs.clone(),
                pipeline,
                retry,
                WorkerConfig::default().with_worker_id(id).with_batch_size(4),
            )
        }
    }

    fn sale(event_id: &str, resource_id: &str) -> TriggerEvent {
        TriggerEvent::new(event_id, "sale.completed", resource_id)
            .with_tenant_hint("acme")
            .with_recipient(Recipient::email("guest@example.com"))
    }

    async fn job_status(rig: &Rig, outcome: EnqueueOutcome) -> JobStatus {
        rig.jobs
            .get(outcome.job_id())
            .await
            .unwrap()
            .unwrap()
            .status
    }

    #[tokio::test]
    async fn delivered_event_completes_exactly_once() {
        let rig = Rig::with_fallback_tenant();
        let worker = rig.worker("w1");
        let now = Utc::now();
        let before = rig.jobs.counts().await.unwrap();

        let outcome = rig.enqueuer.accept(&sale("evt-1", "sale-1"), now).await.unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Accepted { .. }));

        let report = worker.tick_at(now).await.unwrap();
        assert_eq!(report.completed, 1);

        let after = rig.jobs.counts().await.unwrap();
        assert_eq!(after.completed, before.completed + 1);
        assert_eq!(after.queued, before.queued);
        assert_eq!(after.running, before.running);
        assert_eq!(after.error, before.error);

        let job = rig.jobs.get(outcome.job_id()).await.unwrap().unwrap();
        assert_eq!(job.stage, Stage::Done);
        assert_eq!(job.attempts, 1);
        assert_eq!(rig.rewards.instruments_issued(), 1);
        assert_eq!(rig.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn three_failures_exhaust_the_job() {
        let rig = Rig::with_fallback_tenant();
        let worker = rig.worker("w1");
        rig.rewards
            .fail_issue(ProviderError::Unavailable("503 Service Unavailable".into()), 3);
        let t0 = Utc::now();
        let outcome = rig.enqueuer.accept(&sale("evt-1", "sale-1"), t0).await.unwrap();

        let mut now = t0;
        let mut schedule: Vec<DateTime<Utc>> = Vec::new();
        for _ in 0..2 {
            let report = worker.tick_at(now).await.unwrap();
            assert_eq!(report.retried, 1);
            let job = rig.jobs.get(outcome.job_id()).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Queued);
            schedule.push(job.scheduled_at);
            now = job.scheduled_at;
        }
        assert!(schedule[1] > schedule[0]);
        assert!(schedule[0] > t0);

        let report = worker.tick_at(now).await.unwrap();
        assert_eq!(report.dead_lettered, 1);

        let job = rig.jobs.get(outcome.job_id()).await.unwrap().unwrap();
        assert_eq!(job.status.kind(), StatusKind::Error);
        assert_eq!(job.attempts, 3);
        assert!(job.last_error.as_deref().unwrap().contains("503"));

        // No fourth attempt, however late.
        let later = now + chrono::Duration::hours(1);
        assert_eq!(worker.tick_at(later).await.unwrap().claimed, 0);
        assert_eq!(rig.rewards.calls(), 3);

        let letters = rig.dead_letters.list(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].job_id, outcome.job_id());
        assert_eq!(letters[0].attempts, 3);
    }

    #[tokio::test]
    async fn redelivery_after_partial_progress_issues_one_instrument() {
        let rig = Rig::with_fallback_tenant();
        let worker = rig.worker("w1");
        rig.rewards
            .fail_activate(ProviderError::Transport("connection reset".into()), 1);
        let t0 = Utc::now();

        let first = rig.enqueuer.accept(&sale("evt-1", "sale-1"), t0).await.unwrap();
        worker.tick_at(t0).await.unwrap();
        let job = rig.jobs.get(first.job_id()).await.unwrap().unwrap();
        assert_eq!(job.stage, Stage::ActivateInstrument);
        assert!(job.context.instrument_id.is_some());

        let again = rig.enqueuer.accept(&sale("evt-1", "sale-1"), t0).await.unwrap();
        assert_eq!(again, EnqueueOutcome::DuplicateDelivery { job_id: first.job_id() });
        let other = rig.enqueuer.accept(&sale("evt-2", "sale-1"), t0).await.unwrap();
        assert_eq!(other, EnqueueOutcome::Converged { job_id: first.job_id() });

        worker.tick_at(job.scheduled_at).await.unwrap();
        assert_eq!(job_status(&rig, first).await, JobStatus::Completed);
        assert_eq!(rig.rewards.instruments_issued(), 1);
        assert_eq!(rig.jobs.counts().await.unwrap().total(), 1);
        assert_eq!(
            rig.runs.get("evt-1").await.unwrap().unwrap().job_id,
            Some(first.job_id())
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_workers_complete_each_job_once() {
        let rig = Rig::with_fallback_tenant();
        let now = Utc::now();
        let mut job_ids = Vec::new();
        for i in 0..12 {
            let event = sale(&format!("evt-{i}"), &format!("sale-{i}"));
            job_ids.push(rig.enqueuer.accept(&event, now).await.unwrap().job_id());
        }

        let workers: Vec<Worker> = (0..4).map(|i| rig.worker(&format!("w{i}"))).collect();
        let mut tasks = tokio::task::JoinSet::new();
        for worker in workers {
            tasks.spawn(async move {
                let mut completed = 0;
                loop {
                    let report = worker.tick_at(now).await.unwrap();
                    if report.claimed == 0 {
                        return completed;
                    }
                    completed += report.completed;
                }
            });
        }
        let mut completed = 0;
        while let Some(n) = tasks.join_next().await {
            completed += n.unwrap();
        }

        assert_eq!(completed, job_ids.len());
        for id in job_ids {
            let job = rig.jobs.get(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Completed);
            assert_eq!(job.attempts, 1);
        }
        assert_eq!(rig.rewards.instruments_issued(), 12);
    }

    #[tokio::test]
    async fn crashed_worker_lease_is_reaped_and_resumed() {
        let rig = Rig::with_fallback_tenant();
        let t0 = Utc::now();
        let outcome = rig.enqueuer.accept(&sale("evt-1", "sale-1"), t0).await.unwrap();

        // A worker that claims and then dies.
        let leased = rig.jobs.claim("crashed", 1, t0).await.unwrap();
        assert_eq!(leased.len(), 1);

        let status = rig.status.report(10, t0 + chrono::Duration::minutes(5)).await.unwrap();
        assert_eq!(status.stuck_jobs.len(), 1);
        assert_eq!(status.stuck_jobs[0].lock_owner.as_deref(), Some("crashed"));

        let t5 = t0 + chrono::Duration::minutes(5);
        let report = rig.reaper.reap_at(t5).await.unwrap();
        assert_eq!(report.reclaimed, 1);
        let job = rig.jobs.get(outcome.job_id()).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.locked_at(), None);

        let report = rig.worker("w1").tick_at(t5).await.unwrap();
        assert_eq!(report.completed, 1);
        let job = rig.jobs.get(outcome.job_id()).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn reset_revives_error_jobs_and_leaves_stuck_ones() {
        let rig = Rig::new(InMemoryTenantResolver::new());
        let worker = rig.worker("w1");
        let t0 = Utc::now();

        // No tenant for "acme": rejected, fatal on the first attempt.
        let failed = rig.enqueuer.accept(&sale("evt-1", "sale-1"), t0).await.unwrap();
        assert_eq!(worker.tick_at(t0).await.unwrap().dead_lettered, 1);
        assert_eq!(job_status(&rig, failed).await.kind(), StatusKind::Error);

        let stuck = rig.enqueuer.accept(&sale("evt-2", "sale-2"), t0).await.unwrap();
        rig.jobs.claim("crashed", 1, t0).await.unwrap();

        let t10 = t0 + chrono::Duration::minutes(10);
        let report = rig.admin.reset(ResetFilter::errors(), t10).await.unwrap();
        assert_eq!((report.error_reset, report.stuck_reset), (1, 0));

        let revived = rig.jobs.get(failed.job_id()).await.unwrap().unwrap();
        assert_eq!(revived.status, JobStatus::Queued);
        assert_eq!(revived.attempts, 0);
        assert_eq!(job_status(&rig, stuck).await.kind(), StatusKind::Running);

        rig.resolver.insert("acme", TenantId::new());
        let report = worker.tick_at(t10).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(job_status(&rig, failed).await, JobStatus::Completed);

        let report = rig.admin.reset(ResetFilter::stuck(), t10).await.unwrap();
        assert_eq!((report.error_reset, report.stuck_reset), (0, 1));
        let reset = rig.jobs.get(stuck.job_id()).await.unwrap().unwrap();
        assert_eq!(reset.status, JobStatus::Queued);
        assert_eq!(reset.attempts, 1);
    }
}
