//! Ports for the external collaborators a job talks to.
//!
//! Every call that has a side effect takes an idempotency key
//! (`"<correlation_id>:<stage>"`); a provider seeing the same key twice must
//! return the original result instead of acting again.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use rewardflow_core::TenantId;
use rewardflow_events::Recipient;

pub mod http;
pub mod memory;

pub use http::{HttpNotificationProvider, HttpRewardProvider, HttpTenantResolver};
pub use memory::{InMemoryNotificationProvider, InMemoryRewardProvider, InMemoryTenantResolver};

/// Failure reported by a provider adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Connection, timeout or other I/O failure
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    /// 5xx or an equivalent outage
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    /// The provider refused the request; retrying will not help
    #[error("rejected by provider: {0}")]
    Rejected(String),
    /// Response could not be understood
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Transport(_) | ProviderError::RateLimited { .. } | ProviderError::Unavailable(_)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Issues and activates reward instruments (gift cards, vouchers, ...).
#[async_trait]
pub trait RewardProvider: Send + Sync {
    /// Returns the new instrument id.
    async fn issue(
        &self,
        amount_cents: i64,
        recipient: &Recipient,
        idempotency_key: &str,
    ) -> Result<String, ProviderError>;

    /// Returns the balance after activation, in cents.
    async fn activate(
        &self,
        instrument_id: &str,
        amount_cents: i64,
        idempotency_key: &str,
    ) -> Result<i64, ProviderError>;
}

/// A message to deliver to a recipient.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub channel: String,
    pub recipient: Recipient,
    pub template: String,
    /// Template variables
    pub data: serde_json::Value,
}

#[async_trait]
pub trait NotificationProvider: Send + Sync {
    /// Returns the provider's delivery id.
    async fn send(
        &self,
        notification: &Notification,
        idempotency_key: &str,
    ) -> Result<String, ProviderError>;
}

/// Maps business identifiers (most specific first) to a tenant.
#[async_trait]
pub trait TenantResolver: Send + Sync {
    async fn resolve(&self, identifiers: &[String]) -> Result<TenantId, ProviderError>;
}
