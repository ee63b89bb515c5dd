//! Inbound trigger descriptor and correlation key derivation.

use serde::{Deserialize, Serialize};

use rewardflow_core::{DomainError, DomainResult};

use crate::Recipient;

/// Classifies the originating event (e.g. `reservation.created`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerType(String);

impl TriggerType {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic key grouping every delivery and attempt of one business event.
///
/// Always `"<event-type>:<resource-id>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn derive(event_type: &str, resource_id: &str) -> Self {
        Self(format!("{event_type}:{resource_id}"))
    }

    /// Wrap an already-derived key (e.g. read back from storage).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A raw delivery of a business event.
///
/// `event_id` identifies the delivery's event as assigned by the sender and is
/// what duplicate deliveries share. `resource_id` identifies the business
/// object the event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEvent {
    pub event_id: String,
    pub event_type: String,
    pub resource_id: String,
    #[serde(default)]
    pub tenant_hint: Option<String>,
    #[serde(default)]
    pub recipient: Option<Recipient>,
    #[serde(default)]
    pub amount_cents: Option<i64>,
}

impl TriggerEvent {
    pub fn new(
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: event_type.into(),
            resource_id: resource_id.into(),
            tenant_hint: None,
            recipient: None,
            amount_cents: None,
        }
    }

    pub fn with_tenant_hint(mut self, hint: impl Into<String>) -> Self {
        self.tenant_hint = Some(hint.into());
        self
    }

    pub fn with_recipient(mut self, recipient: Recipient) -> Self {
        self.recipient = Some(recipient);
        self
    }

    pub fn with_amount_cents(mut self, amount: i64) -> Self {
        self.amount_cents = Some(amount);
        self
    }

    pub fn trigger_type(&self) -> TriggerType {
        TriggerType::new(self.event_type.clone())
    }

    pub fn correlation_id(&self) -> CorrelationId {
        CorrelationId::derive(&self.event_type, &self.resource_id)
    }

    /// Reject descriptors that could never produce a well-formed job.
    pub fn validate(&self) -> DomainResult<()> {
        if self.event_id.trim().is_empty() {
            return Err(DomainError::validation("eventId must not be empty"));
        }
        if self.event_type.trim().is_empty() {
            return Err(DomainError::validation("eventType must not be empty"));
        }
        // The separator would make correlation keys ambiguous.
        if self.event_type.contains(':') {
            return Err(DomainError::validation("eventType must not contain ':'"));
        }
        if self.resource_id.trim().is_empty() {
            return Err(DomainError::validation("resourceId must not be empty"));
        }
        if let Some(amount) = self.amount_cents {
            if amount <= 0 {
                return Err(DomainError::validation("amountCents must be positive"));
            }
        }
        Ok(())
    }
}
