//! Ordered, resumable stage execution for one leased job.
//!
//! The executor starts at `job.stage`, so a retried or reclaimed job picks up
//! at the stage that failed. Each stage's output is committed together with
//! the stage advance; a failure leaves both untouched.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use rewardflow_core::DomainError;
use rewardflow_events::CorrelationId;

use crate::providers::{NotificationProvider, ProviderError, RewardProvider, TenantResolver};

use super::clock::Clock;
use super::document::{JobContext, JobPayload, StageOutput, check_entry};
use super::handlers::{
    ActivateInstrumentHandler, IssueInstrumentHandler, NotifyHandler, ResolveTenantHandler,
};
use super::retry::FailureClass;
use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobId, Stage};

/// What a handler sees.
#[derive(Debug, Clone, Copy)]
pub struct StageInput<'a> {
    pub job_id: JobId,
    pub correlation_id: &'a CorrelationId,
    pub stage: Stage,
    pub payload: &'a JobPayload,
    pub context: &'a JobContext,
}

impl StageInput<'_> {
    /// Key that makes the stage's side effect idempotent at the provider.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.correlation_id, self.stage)
    }
}

/// Stage failure, classified for the retry controller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error("stage contract violated: {0}")]
    Contract(#[from] DomainError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

impl StageError {
    pub fn class(&self) -> FailureClass {
        match self {
            StageError::Contract(_) => FailureClass::Fatal,
            StageError::Provider(e) if e.is_retryable() => FailureClass::Retryable {
                retry_after: e.retry_after(),
            },
            StageError::Provider(_) => FailureClass::Fatal,
            StageError::Store(JobStoreError::Corrupt(_)) => FailureClass::Fatal,
            StageError::Store(_) => FailureClass::retryable(),
        }
    }

    /// The job was taken away from this worker; nothing more may be written.
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, StageError::Store(JobStoreError::LeaseLost { .. }))
    }
}

/// One pipeline step.
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> Stage;

    /// Must be safe to call again after a crash between side effect and commit.
    async fn run(&self, input: StageInput<'_>) -> Result<StageOutput, StageError>;
}

#[derive(Debug)]
pub enum PipelineOutcome {
    Completed(Job),
    /// `job` is the last committed state; `stage` is where it stopped.
    Failed {
        job: Job,
        stage: Stage,
        error: StageError,
    },
}

pub struct StagePipeline {
    store: Arc<dyn JobStore>,
    handlers: HashMap<Stage, Arc<dyn StageHandler>>,
}

impl StagePipeline {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
        }
    }

    /// Pipeline with the reward handlers for every stage.
    pub fn standard(
        store: Arc<dyn JobStore>,
        resolver: Arc<dyn TenantResolver>,
        rewards: Arc<dyn RewardProvider>,
        notifier: Arc<dyn NotificationProvider>,
    ) -> Self {
        Self::new(store)
            .with_handler(Arc::new(ResolveTenantHandler::new(resolver)))
            .with_handler(Arc::new(IssueInstrumentHandler::new(rewards.clone())))
            .with_handler(Arc::new(ActivateInstrumentHandler::new(rewards)))
            .with_handler(Arc::new(NotifyHandler::new(notifier)))
    }

    pub fn with_handler(mut self, handler: Arc<dyn StageHandler>) -> Self {
        self.handlers.insert(handler.stage(), handler);
        self
    }

    /// Stages that have no handler registered.
    pub fn missing_stages(&self) -> Vec<Stage> {
        Stage::PIPELINE
            .into_iter()
            .filter(|s| !self.handlers.contains_key(s))
            .collect()
    }

    /// Run the leased `job` from its current stage to completion or the first
    /// failure. Each commit is stamped with `clock` at the time it happens.
    pub async fn execute(&self, mut job: Job, owner: &str, clock: impl Into<Clock>) -> PipelineOutcome {
        let clock = clock.into();
        while !job.stage.is_done() {
            let stage = job.stage;
            match self.run_stage(&job, owner, clock).await {
                Ok(next) => {
                    debug!(
                        job_id = %job.id,
                        correlation_id = %job.correlation_id,
                        stage = %stage,
                        "stage committed"
                    );
                    job = next;
                }
                Err(error) => return PipelineOutcome::Failed { job, stage, error },
            }
        }
        PipelineOutcome::Completed(job)
    }

    async fn run_stage(&self, job: &Job, owner: &str, clock: Clock) -> Result<Job, StageError> {
        let stage = job.stage;
        let handler = self
            .handlers
            .get(&stage)
            .ok_or_else(|| DomainError::invariant(format!("no handler for stage {stage}")))?;

        check_entry(stage, &job.payload, &job.context)?;

        let input = StageInput {
            job_id: job.id,
            correlation_id: &job.correlation_id,
            stage,
            payload: &job.payload,
            context: &job.context,
        };
        let output = handler.run(input).await?;
        if output.stage() != stage {
            return Err(DomainError::invariant(format!(
                "handler for {stage} produced output for {}",
                output.stage()
            ))
            .into());
        }
        let context = job.context.with_output(output)?;

        let next = stage.next();
        let now = clock.now();
        let committed = if next.is_done() {
            self.store.complete(job.id, owner, &context, now).await?
        } else {
            self.store.commit_stage(job.id, owner, next, &context, now).await?
        };
        Ok(committed)
    }
}
