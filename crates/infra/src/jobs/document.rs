//! Versioned job documents: the immutable payload and the stage context.
//!
//! Each stage declares what it reads and writes; `check_entry` validates those
//! reads before a handler runs so a malformed job fails fast and fatally
//! instead of half-executing.

use serde::{Deserialize, Serialize};

use rewardflow_core::{DomainError, DomainResult, TenantId};
use rewardflow_events::Recipient;

use super::types::Stage;

pub const PAYLOAD_VERSION: u32 = 1;
pub const CONTEXT_VERSION: u32 = 1;

/// Input captured at enqueue time. Never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub version: u32,
    /// Delivery that created the job
    pub event_id: String,
    pub resource_id: String,
    #[serde(default)]
    pub tenant_hint: Option<String>,
    pub amount_cents: i64,
    #[serde(default)]
    pub recipient: Recipient,
    /// Notification channel (`email` or `sms`)
    pub channel: String,
    pub template: String,
}

impl JobPayload {
    /// Identifier chain handed to the tenant resolver, most specific first.
    pub fn identifier_chain(&self) -> Vec<String> {
        let mut chain = Vec::with_capacity(2);
        if let Some(hint) = self.tenant_hint.as_deref().filter(|h| !h.trim().is_empty()) {
            chain.push(hint.to_string());
        }
        chain.push(self.resource_id.clone());
        chain
    }

    fn check_version(&self) -> DomainResult<()> {
        if self.version != PAYLOAD_VERSION {
            return Err(DomainError::validation(format!(
                "unsupported payload version {}",
                self.version
            )));
        }
        Ok(())
    }

    fn check_amount(&self) -> DomainResult<()> {
        if self.amount_cents <= 0 {
            return Err(DomainError::validation("amount_cents must be positive"));
        }
        Ok(())
    }

    fn check_recipient(&self) -> DomainResult<&str> {
        if !self.recipient.is_reachable() {
            return Err(DomainError::validation("recipient has no contact point"));
        }
        self.recipient
            .address_for(&self.channel)
            .filter(|a| !a.trim().is_empty())
            .ok_or_else(|| {
                DomainError::validation(format!("recipient has no address for channel {}", self.channel))
            })
    }
}

/// Outputs accumulated from committed stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobContext {
    pub version: u32,
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    #[serde(default)]
    pub instrument_id: Option<String>,
    #[serde(default)]
    pub balance_cents: Option<i64>,
    #[serde(default)]
    pub delivery_id: Option<String>,
}

impl Default for JobContext {
    fn default() -> Self {
        Self {
            version: CONTEXT_VERSION,
            tenant_id: None,
            instrument_id: None,
            balance_cents: None,
            delivery_id: None,
        }
    }
}

/// Typed result of a stage handler; the only way context gets written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutput {
    TenantResolved(TenantId),
    InstrumentIssued { instrument_id: String },
    InstrumentActivated { balance_cents: i64 },
    NotificationSent { delivery_id: String },
}

impl StageOutput {
    /// Stage that is allowed to produce this output.
    pub fn stage(&self) -> Stage {
        match self {
            StageOutput::TenantResolved(_) => Stage::ResolveTenant,
            StageOutput::InstrumentIssued { .. } => Stage::IssueInstrument,
            StageOutput::InstrumentActivated { .. } => Stage::ActivateInstrument,
            StageOutput::NotificationSent { .. } => Stage::Notify,
        }
    }
}

impl JobContext {
    /// Context after `output` is committed. Re-applying the same value is a
    /// no-op; overwriting a different recorded value is an invariant violation
    /// (e.g. a second instrument for the same job).
    pub fn with_output(&self, output: StageOutput) -> DomainResult<JobContext> {
        let mut next = self.clone();
        match output {
            StageOutput::TenantResolved(tenant) => set_once(&mut next.tenant_id, tenant, "tenant_id")?,
            StageOutput::InstrumentIssued { instrument_id } => {
                set_once(&mut next.instrument_id, instrument_id, "instrument_id")?
            }
            StageOutput::InstrumentActivated { balance_cents } => {
                set_once(&mut next.balance_cents, balance_cents, "balance_cents")?
            }
            StageOutput::NotificationSent { delivery_id } => {
                set_once(&mut next.delivery_id, delivery_id, "delivery_id")?
            }
        }
        Ok(next)
    }

    pub fn require_tenant(&self) -> DomainResult<TenantId> {
        self.tenant_id
            .ok_or_else(|| DomainError::invariant("tenant_id missing from context"))
    }

    pub fn require_instrument(&self) -> DomainResult<&str> {
        self.instrument_id
            .as_deref()
            .ok_or_else(|| DomainError::invariant("instrument_id missing from context"))
    }

    pub fn require_balance(&self) -> DomainResult<i64> {
        self.balance_cents
            .ok_or_else(|| DomainError::invariant("balance_cents missing from context"))
    }
}

fn set_once<T: PartialEq>(slot: &mut Option<T>, value: T, field: &str) -> DomainResult<()> {
    match slot {
        Some(existing) if *existing != value => Err(DomainError::invariant(format!(
            "{field} already recorded with a different value"
        ))),
        Some(_) => Ok(()),
        None => {
            *slot = Some(value);
            Ok(())
        }
    }
}

/// Validate a stage's declared reads before its handler runs.
///
/// | stage | reads |
/// |---|---|
/// | resolve_tenant | payload.resource_id, payload.tenant_hint |
/// | issue_instrument | context.tenant_id, payload.amount_cents, payload.recipient |
/// | activate_instrument | context.instrument_id, payload.amount_cents |
/// | notify | context.instrument_id, context.balance_cents, payload.recipient, channel, template |
pub fn check_entry(stage: Stage, payload: &JobPayload, context: &JobContext) -> DomainResult<()> {
    payload.check_version()?;
    if context.version != CONTEXT_VERSION {
        return Err(DomainError::validation(format!(
            "unsupported context version {}",
            context.version
        )));
    }

    match stage {
        Stage::ResolveTenant => {
            if payload.resource_id.trim().is_empty() {
                return Err(DomainError::validation("resource_id must not be empty"));
            }
        }
        Stage::IssueInstrument => {
            context.require_tenant()?;
            payload.check_amount()?;
            payload.check_recipient()?;
        }
        Stage::ActivateInstrument => {
            context.require_instrument()?;
            payload.check_amount()?;
        }
        Stage::Notify => {
            context.require_instrument()?;
            context.require_balance()?;
            payload.check_recipient()?;
            if payload.template.trim().is_empty() {
                return Err(DomainError::validation("template must not be empty"));
            }
        }
        Stage::Done => {
            return Err(DomainError::invariant("pipeline already finished"));
        }
    }
    Ok(())
}
