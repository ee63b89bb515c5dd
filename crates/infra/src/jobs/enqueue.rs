//! Trigger event → run bookkeeping → job row.
//!
//! The run (keyed by `event_id`) decides whether a raw delivery was seen
//! before. The job store (keyed by correlation id) decides whether the
//! business event already has work, and creates it atomically so concurrent
//! deliveries share one job. A run whose job has disappeared is repaired by
//! linking it to a fresh job.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use rewardflow_core::DomainError;
use rewardflow_events::TriggerEvent;

use crate::runs::{Run, RunRecord, RunStore, RunStoreError};

use super::document::{JobPayload, PAYLOAD_VERSION};
use super::store::{JobStore, JobStoreError, Placement};
use super::types::{JobId, NewJob};

/// Reward and notification settings for one trigger type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardProgram {
    pub amount_cents: i64,
    pub channel: String,
    pub template: String,
}

impl RewardProgram {
    pub fn new(amount_cents: i64, channel: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            amount_cents,
            channel: channel.into(),
            template: template.into(),
        }
    }
}

/// What happened to an inbound delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    /// New delivery, new job.
    Accepted {
        #[serde(rename = "jobId")]
        job_id: JobId,
    },
    /// This `event_id` was already accepted.
    DuplicateDelivery {
        #[serde(rename = "jobId")]
        job_id: JobId,
    },
    /// New delivery of a business event that already has a job.
    Converged {
        #[serde(rename = "jobId")]
        job_id: JobId,
    },
    /// Known delivery whose job was missing; a fresh job was linked.
    Recovered {
        #[serde(rename = "jobId")]
        job_id: JobId,
    },
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            EnqueueOutcome::Accepted { job_id }
            | EnqueueOutcome::DuplicateDelivery { job_id }
            | EnqueueOutcome::Converged { job_id }
            | EnqueueOutcome::Recovered { job_id } => *job_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("invalid trigger: {0}")]
    Invalid(#[from] DomainError),
    #[error("no reward program for trigger type {0:?}")]
    UnknownTrigger(String),
    #[error(transparent)]
    Jobs(#[from] JobStoreError),
    #[error(transparent)]
    Runs(#[from] RunStoreError),
}

pub struct Enqueuer {
    jobs: Arc<dyn JobStore>,
    runs: Arc<dyn RunStore>,
    programs: HashMap<String, RewardProgram>,
    max_attempts: u32,
}

impl Enqueuer {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        runs: Arc<dyn RunStore>,
        programs: HashMap<String, RewardProgram>,
        max_attempts: u32,
    ) -> Self {
        Self {
            jobs,
            runs,
            programs,
            max_attempts,
        }
    }

    /// Record the delivery and make sure its business event has a job.
    ///
    /// Safe to call any number of times for the same event.
    pub async fn accept(
        &self,
        event: &TriggerEvent,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, EnqueueError> {
        event.validate()?;
        let program = self
            .programs
            .get(&event.event_type)
            .ok_or_else(|| EnqueueError::UnknownTrigger(event.event_type.clone()))?;
        let correlation_id = event.correlation_id();

        let run = Run::new(
            event.event_id.clone(),
            correlation_id.clone(),
            event.event_type.clone(),
            now,
        );

        let outcome = match self.runs.record(run).await? {
            RunRecord::Inserted(_) => match self.place_job(event, program, now).await? {
                Placement::Created(job) => EnqueueOutcome::Accepted { job_id: job.id },
                Placement::Existing(job) => EnqueueOutcome::Converged { job_id: job.id },
            },
            RunRecord::Existing(run) => {
                let linked = match run.job_id {
                    Some(id) => self.jobs.get(id).await?.map(|job| job.id),
                    None => None,
                };
                match linked {
                    Some(job_id) => EnqueueOutcome::DuplicateDelivery { job_id },
                    // Either the first delivery is still placing its job, or
                    // the linked job is gone.
                    None => match self.place_job(event, program, now).await? {
                        Placement::Existing(job) => EnqueueOutcome::DuplicateDelivery { job_id: job.id },
                        Placement::Created(job) => {
                            warn!(
                                event_id = %event.event_id,
                                %correlation_id,
                                lost_job_id = ?run.job_id,
                                job_id = %job.id,
                                "known delivery had no job, enqueued a fresh one"
                            );
                            EnqueueOutcome::Recovered { job_id: job.id }
                        }
                    },
                }
            }
        };

        self.runs.attach_job(&event.event_id, outcome.job_id()).await?;
        info!(
            event_id = %event.event_id,
            %correlation_id,
            job_id = %outcome.job_id(),
            outcome = ?outcome,
            "delivery accepted"
        );
        Ok(outcome)
    }

    /// The job for the event's correlation id, created if there is none.
    async fn place_job(
        &self,
        event: &TriggerEvent,
        program: &RewardProgram,
        now: DateTime<Utc>,
    ) -> Result<Placement, EnqueueError> {
        let payload = JobPayload {
            version: PAYLOAD_VERSION,
            event_id: event.event_id.clone(),
            resource_id: event.resource_id.clone(),
            tenant_hint: event.tenant_hint.clone(),
            amount_cents: event.amount_cents.unwrap_or(program.amount_cents),
            recipient: event.recipient.clone().unwrap_or_default(),
            channel: program.channel.clone(),
            template: program.template.clone(),
        };
        let job = NewJob::new(
            event.correlation_id(),
            event.trigger_type(),
            payload,
            self.max_attempts,
        );
        Ok(self.jobs.find_or_enqueue(job, now).await?)
    }
}
