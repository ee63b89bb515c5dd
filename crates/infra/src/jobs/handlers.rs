//! Stage handlers for the reward pipeline.
//!
//! Each handler returns the output already recorded in context when there is
//! one, and otherwise calls its provider with the stage's idempotency key.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::providers::{Notification, NotificationProvider, RewardProvider, TenantResolver};

use super::document::StageOutput;
use super::pipeline::{StageError, StageHandler, StageInput};
use super::types::Stage;

pub struct ResolveTenantHandler {
    resolver: Arc<dyn TenantResolver>,
}

impl ResolveTenantHandler {
    pub fn new(resolver: Arc<dyn TenantResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl StageHandler for ResolveTenantHandler {
    fn stage(&self) -> Stage {
        Stage::ResolveTenant
    }

    async fn run(&self, input: StageInput<'_>) -> Result<StageOutput, StageError> {
        if let Some(tenant) = input.context.tenant_id {
            return Ok(StageOutput::TenantResolved(tenant));
        }
        let tenant = self
            .resolver
            .resolve(&input.payload.identifier_chain())
            .await?;
        Ok(StageOutput::TenantResolved(tenant))
    }
}

pub struct IssueInstrumentHandler {
    rewards: Arc<dyn RewardProvider>,
}

impl IssueInstrumentHandler {
    pub fn new(rewards: Arc<dyn RewardProvider>) -> Self {
        Self { rewards }
    }
}

#[async_trait]
impl StageHandler for IssueInstrumentHandler {
    fn stage(&self) -> Stage {
        Stage::IssueInstrument
    }

    async fn run(&self, input: StageInput<'_>) -> Result<StageOutput, StageError> {
        if let Some(instrument_id) = &input.context.instrument_id {
            return Ok(StageOutput::InstrumentIssued {
                instrument_id: instrument_id.clone(),
            });
        }
        let instrument_id = self
            .rewards
            .issue(
                input.payload.amount_cents,
                &input.payload.recipient,
                &input.idempotency_key(),
            )
            .await?;
        Ok(StageOutput::InstrumentIssued { instrument_id })
    }
}

pub struct ActivateInstrumentHandler {
    rewards: Arc<dyn RewardProvider>,
}

impl ActivateInstrumentHandler {
    pub fn new(rewards: Arc<dyn RewardProvider>) -> Self {
        Self { rewards }
    }
}

#[async_trait]
impl StageHandler for ActivateInstrumentHandler {
    fn stage(&self) -> Stage {
        Stage::ActivateInstrument
    }

    async fn run(&self, input: StageInput<'_>) -> Result<StageOutput, StageError> {
        if let Some(balance_cents) = input.context.balance_cents {
            return Ok(StageOutput::InstrumentActivated { balance_cents });
        }
        let instrument_id = input.context.require_instrument()?;
        let balance_cents = self
            .rewards
            .activate(
                instrument_id,
                input.payload.amount_cents,
                &input.idempotency_key(),
            )
            .await?;
        Ok(StageOutput::InstrumentActivated { balance_cents })
    }
}

pub struct NotifyHandler {
    notifier: Arc<dyn NotificationProvider>,
}

impl NotifyHandler {
    pub fn new(notifier: Arc<dyn NotificationProvider>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl StageHandler for NotifyHandler {
    fn stage(&self) -> Stage {
        Stage::Notify
    }

    async fn run(&self, input: StageInput<'_>) -> Result<StageOutput, StageError> {
        if let Some(delivery_id) = &input.context.delivery_id {
            return Ok(StageOutput::NotificationSent {
                delivery_id: delivery_id.clone(),
            });
        }
        let payload = input.payload;
        let notification = Notification {
            channel: payload.channel.clone(),
            recipient: payload.recipient.clone(),
            template: payload.template.clone(),
            data: json!({
                "instrumentId": input.context.require_instrument()?,
                "balanceCents": input.context.require_balance()?,
                "amountCents": payload.amount_cents,
                "tenantId": input.context.tenant_id,
                "resourceId": payload.resource_id,
            }),
        };
        let delivery_id = self
            .notifier
            .send(&notification, &input.idempotency_key())
            .await?;
        Ok(StageOutput::NotificationSent { delivery_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::document::JobContext;
    use crate::jobs::types::tests::new_job;
    use crate::providers::memory::{InMemoryNotificationProvider, InMemoryRewardProvider};
    use chrono::Utc;

    #[tokio::test]
    async fn issue_skips_provider_when_instrument_recorded() {
        let rewards = Arc::new(InMemoryRewardProvider::new());
        let handler = IssueInstrumentHandler::new(rewards.clone());
        let job = new_job(3, Utc::now());
        let context = JobContext {
            instrument_id: Some("inst-existing".to_string()),
            ..JobContext::default()
        };
        let input = StageInput {
            job_id: job.id,
            correlation_id: &job.correlation_id,
            stage: Stage::IssueInstrument,
            payload: &job.payload,
            context: &context,
        };

        let output = handler.run(input).await.unwrap();
        assert_eq!(
            output,
            StageOutput::InstrumentIssued {
                instrument_id: "inst-existing".to_string()
            }
        );
        assert_eq!(rewards.calls(), 0);
    }

    #[tokio::test]
    async fn replayed_issue_converges_on_one_instrument() {
        let rewards = Arc::new(InMemoryRewardProvider::new());
        let handler = IssueInstrumentHandler::new(rewards.clone());
        let job = new_job(3, Utc::now());
        let input = StageInput {
            job_id: job.id,
            correlation_id: &job.correlation_id,
            stage: Stage::IssueInstrument,
            payload: &job.payload,
            context: &job.context,
        };

        // Crash between side effect and commit: the stage runs twice.
        let first = handler.run(input).await.unwrap();
        let second = handler.run(input).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(rewards.instruments_issued(), 1);
    }

    #[tokio::test]
    async fn notify_passes_template_data() {
        let notifier = Arc::new(InMemoryNotificationProvider::new());
        let handler = NotifyHandler::new(notifier.clone());
        let job = new_job(3, Utc::now());
        let context = JobContext {
            instrument_id: Some("inst-1".to_string()),
            balance_cents: Some(1_000),
            ..JobContext::default()
        };
        let input = StageInput {
            job_id: job.id,
            correlation_id: &job.correlation_id,
            stage: Stage::Notify,
            payload: &job.payload,
            context: &context,
        };

        handler.run(input).await.unwrap();
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].template, "sale_reward");
        assert_eq!(sent[0].data["instrumentId"], "inst-1");
        assert_eq!(sent[0].data["balanceCents"], 1_000);
    }
}
