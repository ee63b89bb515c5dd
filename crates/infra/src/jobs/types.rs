//! Job row model and its state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use rewardflow_events::{CorrelationId, TriggerType};

use super::document::{JobContext, JobPayload};

pub use rewardflow_core::JobId;

/// Ordered pipeline steps. `Done` marks a finished pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ResolveTenant,
    IssueInstrument,
    ActivateInstrument,
    Notify,
    Done,
}

impl Stage {
    /// Executable stages in order.
    pub const PIPELINE: [Stage; 4] = [
        Stage::ResolveTenant,
        Stage::IssueInstrument,
        Stage::ActivateInstrument,
        Stage::Notify,
    ];

    pub fn first() -> Self {
        Self::PIPELINE[0]
    }

    pub fn next(self) -> Self {
        match self {
            Stage::ResolveTenant => Stage::IssueInstrument,
            Stage::IssueInstrument => Stage::ActivateInstrument,
            Stage::ActivateInstrument => Stage::Notify,
            Stage::Notify | Stage::Done => Stage::Done,
        }
    }

    pub fn is_done(self) -> bool {
        self == Stage::Done
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::ResolveTenant => "resolve_tenant",
            Stage::IssueInstrument => "issue_instrument",
            Stage::ActivateInstrument => "activate_instrument",
            Stage::Notify => "notify",
            Stage::Done => "done",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "resolve_tenant" => Some(Stage::ResolveTenant),
            "issue_instrument" => Some(Stage::IssueInstrument),
            "activate_instrument" => Some(Stage::ActivateInstrument),
            "notify" => Some(Stage::Notify),
            "done" => Some(Stage::Done),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job status. A lease exists only inside `Running`, so a job can never hold
/// lease fields in any other state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `scheduled_at`, then claimable
    Queued,
    /// Leased to one worker
    Running {
        lease_owner: String,
        leased_at: DateTime<Utc>,
    },
    /// All stages committed
    Completed,
    /// Attempts exhausted or fatal failure; only an admin reset re-queues it
    Error { reason: String },
}

/// Status without payload, for counting and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Queued,
    Running,
    Completed,
    Error,
}

impl StatusKind {
    pub const ALL: [StatusKind; 4] = [
        StatusKind::Queued,
        StatusKind::Running,
        StatusKind::Completed,
        StatusKind::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StatusKind::Queued => "queued",
            StatusKind::Running => "running",
            StatusKind::Completed => "completed",
            StatusKind::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(StatusKind::Queued),
            "running" => Some(StatusKind::Running),
            "completed" => Some(StatusKind::Completed),
            "error" => Some(StatusKind::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for StatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl JobStatus {
    pub fn kind(&self) -> StatusKind {
        match self {
            JobStatus::Queued => StatusKind::Queued,
            JobStatus::Running { .. } => StatusKind::Running,
            JobStatus::Completed => StatusKind::Completed,
            JobStatus::Error { .. } => StatusKind::Error,
        }
    }

    /// Terminal for automatic processing.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error { .. })
    }
}

/// A transition not allowed by the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("cannot {action} a job in status {from}")]
    Invalid {
        from: StatusKind,
        action: &'static str,
    },
    #[error("job is leased by {actual:?}, not {expected}")]
    NotLeaseOwner {
        expected: String,
        actual: Option<String>,
    },
    #[error("attempts exhausted ({attempts}/{max_attempts})")]
    AttemptsExhausted { attempts: u32, max_attempts: u32 },
    #[error("not claimable before {scheduled_at}")]
    NotDue { scheduled_at: DateTime<Utc> },
    #[error("stage cannot move from {from} to {to}")]
    StageOrder { from: Stage, to: Stage },
}

/// Insert request for a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub correlation_id: CorrelationId,
    pub trigger_type: TriggerType,
    pub payload: JobPayload,
    pub max_attempts: u32,
    /// Delay before the first claim; `None` means claimable immediately.
    pub delay: Option<Duration>,
}

impl NewJob {
    pub fn new(
        correlation_id: CorrelationId,
        trigger_type: TriggerType,
        payload: JobPayload,
        max_attempts: u32,
    ) -> Self {
        Self {
            correlation_id,
            trigger_type,
            payload,
            max_attempts,
            delay: None,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Materialize the row as it is inserted.
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        let delay = self
            .delay
            .map(|d| chrono::Duration::from_std(d).unwrap_or_default())
            .unwrap_or_default();
        Job {
            id: JobId::new(),
            correlation_id: self.correlation_id,
            trigger_type: self.trigger_type,
            stage: Stage::first(),
            status: JobStatus::Queued,
            payload: self.payload,
            context: JobContext::default(),
            attempts: 0,
            max_attempts: self.max_attempts.max(1),
            scheduled_at: now + delay,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A durable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub correlation_id: CorrelationId,
    pub trigger_type: TriggerType,
    /// Next stage to execute
    pub stage: Stage,
    pub status: JobStatus,
    /// Immutable input captured at enqueue
    pub payload: JobPayload,
    /// Outputs of committed stages
    pub context: JobContext,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest claim time
    pub scheduled_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn locked_at(&self) -> Option<DateTime<Utc>> {
        match &self.status {
            JobStatus::Running { leased_at, .. } => Some(*leased_at),
            _ => None,
        }
    }

    pub fn lock_owner(&self) -> Option<&str> {
        match &self.status {
            JobStatus::Running { lease_owner, .. } => Some(lease_owner),
            _ => None,
        }
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Running with a lease taken at or before `cutoff`.
    pub fn lease_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.locked_at().is_some_and(|at| at <= cutoff)
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, JobStatus::Queued)
            && self.scheduled_at <= now
            && !self.attempts_exhausted()
    }

    /// queued → running. Consumes one attempt.
    pub fn claim(&mut self, owner: &str, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.expect_kind(StatusKind::Queued, "claim")?;
        if self.attempts_exhausted() {
            return Err(TransitionError::AttemptsExhausted {
                attempts: self.attempts,
                max_attempts: self.max_attempts,
            });
        }
        if self.scheduled_at > now {
            return Err(TransitionError::NotDue {
                scheduled_at: self.scheduled_at,
            });
        }
        self.status = JobStatus::Running {
            lease_owner: owner.to_string(),
            leased_at: now,
        };
        self.attempts += 1;
        self.updated_at = now;
        Ok(())
    }

    /// Persist one stage's output and move to `next`, still leased.
    pub fn commit_stage(
        &mut self,
        owner: &str,
        next: Stage,
        context: JobContext,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.expect_owner(owner)?;
        if next <= self.stage || next.is_done() {
            return Err(TransitionError::StageOrder {
                from: self.stage,
                to: next,
            });
        }
        self.stage = next;
        self.context = context;
        self.updated_at = now;
        Ok(())
    }

    /// running → completed, committing the last stage's output with it.
    pub fn complete(
        &mut self,
        owner: &str,
        context: JobContext,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.expect_owner(owner)?;
        if self.stage.next() != Stage::Done {
            return Err(TransitionError::StageOrder {
                from: self.stage,
                to: Stage::Done,
            });
        }
        self.stage = Stage::Done;
        self.context = context;
        self.status = JobStatus::Completed;
        self.updated_at = now;
        Ok(())
    }

    /// running → queued for another attempt at `at`.
    pub fn requeue(
        &mut self,
        owner: &str,
        at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.expect_owner(owner)?;
        if self.attempts_exhausted() {
            return Err(TransitionError::AttemptsExhausted {
                attempts: self.attempts,
                max_attempts: self.max_attempts,
            });
        }
        self.status = JobStatus::Queued;
        self.scheduled_at = at.max(self.created_at);
        self.last_error = Some(error.to_string());
        self.updated_at = now;
        Ok(())
    }

    /// running → error.
    pub fn fail(&mut self, owner: &str, reason: &str, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.expect_owner(owner)?;
        self.mark_error(reason, now);
        Ok(())
    }

    /// Lease expiry: running → queued, or → error when the expired claim was the
    /// last allowed attempt. Stage, context and attempts are kept.
    pub fn reclaim(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.expect_kind(StatusKind::Running, "reclaim")?;
        if self.attempts_exhausted() {
            self.mark_error("lease expired after final attempt", now);
        } else {
            self.status = JobStatus::Queued;
            self.scheduled_at = now.max(self.created_at);
            self.updated_at = now;
        }
        Ok(())
    }

    /// queued with no attempts left → error.
    pub fn expire_exhausted(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.expect_kind(StatusKind::Queued, "expire")?;
        if !self.attempts_exhausted() {
            return Err(TransitionError::Invalid {
                from: StatusKind::Queued,
                action: "expire a job with attempts left",
            });
        }
        self.mark_error("attempts exhausted while queued", now);
        Ok(())
    }

    /// Admin reset of an error job: attempts start over.
    pub fn reset_error(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.expect_kind(StatusKind::Error, "reset")?;
        self.status = JobStatus::Queued;
        self.attempts = 0;
        self.last_error = None;
        self.scheduled_at = now.max(self.created_at);
        self.updated_at = now;
        Ok(())
    }

    /// Admin reset of a stuck lease: attempts are kept.
    pub fn reset_stuck(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.expect_kind(StatusKind::Running, "reset")?;
        self.status = JobStatus::Queued;
        self.last_error = None;
        self.scheduled_at = now.max(self.created_at);
        self.updated_at = now;
        Ok(())
    }

    fn mark_error(&mut self, reason: &str, now: DateTime<Utc>) {
        self.status = JobStatus::Error {
            reason: reason.to_string(),
        };
        self.last_error = Some(reason.to_string());
        self.updated_at = now;
    }

    fn expect_kind(&self, kind: StatusKind, action: &'static str) -> Result<(), TransitionError> {
        if self.status.kind() == kind {
            Ok(())
        } else {
            Err(TransitionError::Invalid {
                from: self.status.kind(),
                action,
            })
        }
    }

    fn expect_owner(&self, owner: &str) -> Result<(), TransitionError> {
        match &self.status {
            JobStatus::Running { lease_owner, .. } if lease_owner == owner => Ok(()),
            JobStatus::Running { lease_owner, .. } => Err(TransitionError::NotLeaseOwner {
                expected: owner.to_string(),
                actual: Some(lease_owner.clone()),
            }),
            _ => Err(TransitionError::NotLeaseOwner {
                expected: owner.to_string(),
                actual: None,
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::jobs::document::tests::sample_payload;
    use proptest::prelude::*;

    pub(crate) fn new_job(max_attempts: u32, now: DateTime<Utc>) -> Job {
        NewJob::new(
            CorrelationId::derive("sale.completed", "sale-1"),
            TriggerType::new("sale.completed"),
            sample_payload(),
            max_attempts,
        )
        .into_job(now)
    }

    #[test]
    fn stage_order_is_total() {
        let mut stage = Stage::first();
        let mut seen = vec![stage];
        while !stage.is_done() {
            let next = stage.next();
            assert!(next > stage);
            stage = next;
            seen.push(stage);
        }
        assert_eq!(seen.len(), Stage::PIPELINE.len() + 1);
        for s in seen {
            assert_eq!(Stage::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn lifecycle_to_completion() {
        let now = Utc::now();
        let mut job = new_job(3, now);
        assert_eq!(job.locked_at(), None);

        job.claim("w1", now).unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.lock_owner(), Some("w1"));
        assert_eq!(job.locked_at(), Some(now));

        for next in [Stage::IssueInstrument, Stage::ActivateInstrument, Stage::Notify] {
            job.commit_stage("w1", next, job.context.clone(), now).unwrap();
        }
        job.complete("w1", job.context.clone(), now).unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.stage, Stage::Done);
        assert_eq!(job.locked_at(), None);
    }

    #[test]
    fn only_the_lease_owner_may_write() {
        let now = Utc::now();
        let mut job = new_job(3, now);
        job.claim("w1", now).unwrap();

        let err = job.fail("w2", "boom", now).unwrap_err();
        assert!(matches!(err, TransitionError::NotLeaseOwner { actual: Some(ref a), .. } if a == "w1"));
    }

    #[test]
    fn completion_requires_last_stage() {
        let now = Utc::now();
        let mut job = new_job(3, now);
        job.claim("w1", now).unwrap();

        assert!(matches!(
            job.complete("w1", JobContext::default(), now),
            Err(TransitionError::StageOrder { .. })
        ));
    }

    #[test]
    fn claim_refuses_future_and_exhausted_jobs() {
        let now = Utc::now();
        let mut job = new_job(1, now);
        job.scheduled_at = now + chrono::Duration::seconds(10);
        assert!(matches!(job.claim("w1", now), Err(TransitionError::NotDue { .. })));

        job.scheduled_at = now;
        job.claim("w1", now).unwrap();
        job.reclaim(now).unwrap();
        // The single attempt was used by the expired claim.
        assert_eq!(job.status.kind(), StatusKind::Error);
        assert_eq!(job.last_error.as_deref(), Some("lease expired after final attempt"));
    }

    #[test]
    fn reclaim_keeps_progress() {
        let now = Utc::now();
        let mut job = new_job(3, now);
        job.claim("w1", now).unwrap();
        job.commit_stage("w1", Stage::IssueInstrument, job.context.clone(), now)
            .unwrap();

        job.reclaim(now).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.stage, Stage::IssueInstrument);
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn error_is_terminal_until_reset() {
        let now = Utc::now();
        let mut job = new_job(3, now);
        job.claim("w1", now).unwrap();
        job.fail("w1", "bad payload", now).unwrap();

        assert!(job.status.is_terminal());
        assert!(job.claim("w1", now).is_err());
        assert!(job.reclaim(now).is_err());

        job.reset_error(now).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.last_error, None);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Claim,
        Advance,
        Complete,
        Requeue,
        Fail,
        Reclaim,
        Expire,
        ResetError,
        ResetStuck,
        Intruder,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Claim),
            Just(Op::Advance),
            Just(Op::Complete),
            Just(Op::Requeue),
            Just(Op::Fail),
            Just(Op::Reclaim),
            Just(Op::Expire),
            Just(Op::ResetError),
            Just(Op::ResetStuck),
            Just(Op::Intruder),
        ]
    }

    proptest! {
        #[test]
        fn invariants_hold_under_any_transition_sequence(
            ops in proptest::collection::vec(op(), 0..60),
            max_attempts in 1u32..5,
        ) {
            let start = Utc::now();
            let mut job = new_job(max_attempts, start);

            for (i, op) in ops.into_iter().enumerate() {
                let now = start + chrono::Duration::seconds(i as i64);
                let before = job.clone();
                let result = match op {
                    Op::Claim => job.claim("w1", now),
                    Op::Advance => {
                        let next = job.stage.next();
                        job.commit_stage("w1", next, job.context.clone(), now)
                    }
                    Op::Complete => job.complete("w1", job.context.clone(), now),
                    Op::Requeue => job.requeue("w1", now, "transient", now),
                    Op::Fail => job.fail("w1", "fatal", now),
                    Op::Reclaim => job.reclaim(now),
                    Op::Expire => job.expire_exhausted(now),
                    Op::ResetError => job.reset_error(now),
                    Op::ResetStuck => job.reset_stuck(now),
                    Op::Intruder => job.fail("w2", "not mine", now),
                };

                if result.is_err() {
                    prop_assert_eq!(&job, &before);
                }
                prop_assert_eq!(job.locked_at().is_some(), job.status.kind() == StatusKind::Running);
                prop_assert!(job.scheduled_at >= job.created_at);
                prop_assert!(job.stage >= before.stage);
                if matches!(job.status.kind(), StatusKind::Queued | StatusKind::Running) {
                    prop_assert!(job.attempts <= job.max_attempts);
                }
            }
        }
    }
}
