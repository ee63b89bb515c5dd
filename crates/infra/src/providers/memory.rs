//! In-memory providers for dev mode and tests.
//!
//! Each fake honours idempotency keys the way a real provider must and can be
//! scripted to fail the next N calls.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use rewardflow_core::TenantId;
use rewardflow_events::Recipient;

use super::{Notification, NotificationProvider, ProviderError, RewardProvider, TenantResolver};

fn poisoned<T>(_: T) -> ProviderError {
    ProviderError::Unavailable("fake provider state poisoned".to_string())
}

/// Queue of failures returned before any real work happens.
#[derive(Debug, Default)]
struct FailureScript {
    pending: Mutex<VecDeque<ProviderError>>,
}

impl FailureScript {
    fn push(&self, error: ProviderError, times: usize) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.extend(std::iter::repeat_n(error, times));
        }
    }

    fn check(&self) -> Result<(), ProviderError> {
        match self.pending.lock().map_err(poisoned)?.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
struct RewardState {
    /// idempotency key → instrument id
    issued: HashMap<String, String>,
    /// instrument id → balance
    balances: HashMap<String, i64>,
    /// idempotency key → balance returned
    activations: HashMap<String, i64>,
}

#[derive(Debug, Default)]
pub struct InMemoryRewardProvider {
    state: Mutex<RewardState>,
    issue_failures: FailureScript,
    activate_failures: FailureScript,
    calls: AtomicU64,
}

impl InMemoryRewardProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` issue calls with `error`.
    pub fn fail_issue(&self, error: ProviderError, times: usize) {
        self.issue_failures.push(error, times);
    }

    /// Fail the next `times` activate calls with `error`.
    pub fn fail_activate(&self, error: ProviderError, times: usize) {
        self.activate_failures.push(error, times);
    }

    /// Distinct instruments created.
    pub fn instruments_issued(&self) -> usize {
        self.state.lock().map(|s| s.balances.len()).unwrap_or(0)
    }

    /// Issue and activate calls received, including replays and failures.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RewardProvider for InMemoryRewardProvider {
    async fn issue(
        &self,
        amount_cents: i64,
        _recipient: &Recipient,
        idempotency_key: &str,
    ) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.issue_failures.check()?;
        if amount_cents <= 0 {
            return Err(ProviderError::Rejected("amount must be positive".to_string()));
        }

        let mut state = self.state.lock().map_err(poisoned)?;
        if let Some(existing) = state.issued.get(idempotency_key) {
            return Ok(existing.clone());
        }
        let instrument_id = format!("inst-{}", uuid::Uuid::now_v7());
        state.issued.insert(idempotency_key.to_string(), instrument_id.clone());
        state.balances.insert(instrument_id.clone(), 0);
        Ok(instrument_id)
    }

    async fn activate(
        &self,
        instrument_id: &str,
        amount_cents: i64,
        idempotency_key: &str,
    ) -> Result<i64, ProviderError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.activate_failures.check()?;

        let mut state = self.state.lock().map_err(poisoned)?;
        if let Some(balance) = state.activations.get(idempotency_key) {
            return Ok(*balance);
        }
        let balance = state
            .balances
            .get_mut(instrument_id)
            .ok_or_else(|| ProviderError::Rejected(format!("unknown instrument {instrument_id}")))?;
        *balance += amount_cents;
        let balance = *balance;
        state.activations.insert(idempotency_key.to_string(), balance);
        Ok(balance)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryNotificationProvider {
    /// idempotency key → (delivery id, notification)
    deliveries: Mutex<HashMap<String, (String, Notification)>>,
    failures: FailureScript,
}

impl InMemoryNotificationProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_send(&self, error: ProviderError, times: usize) {
        self.failures.push(error, times);
    }

    /// Notifications actually delivered (replays excluded).
    pub fn sent(&self) -> Vec<Notification> {
        self.deliveries
            .lock()
            .map(|d| d.values().map(|(_, n)| n.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl NotificationProvider for InMemoryNotificationProvider {
    async fn send(
        &self,
        notification: &Notification,
        idempotency_key: &str,
    ) -> Result<String, ProviderError> {
        self.failures.check()?;
        if notification
            .recipient
            .address_for(&notification.channel)
            .is_none()
        {
            return Err(ProviderError::Rejected(format!(
                "no address for channel {}",
                notification.channel
            )));
        }

        let mut deliveries = self.deliveries.lock().map_err(poisoned)?;
        if let Some((delivery_id, _)) = deliveries.get(idempotency_key) {
            return Ok(delivery_id.clone());
        }
        let delivery_id = format!("dlv-{}", uuid::Uuid::now_v7());
        deliveries.insert(
            idempotency_key.to_string(),
            (delivery_id.clone(), notification.clone()),
        );
        Ok(delivery_id)
    }
}

/// Resolves from a fixed table, falling back to a default tenant if one is set.
#[derive(Debug, Default)]
pub struct InMemoryTenantResolver {
    tenants: Mutex<HashMap<String, TenantId>>,
    fallback: Option<TenantId>,
    failures: FailureScript,
}

impl InMemoryTenantResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve every unknown identifier to `tenant`.
    pub fn with_fallback(tenant: TenantId) -> Self {
        Self {
            fallback: Some(tenant),
            ..Self::default()
        }
    }

    pub fn insert(&self, identifier: impl Into<String>, tenant: TenantId) {
        if let Ok(mut tenants) = self.tenants.lock() {
            tenants.insert(identifier.into(), tenant);
        }
    }

    pub fn fail_resolve(&self, error: ProviderError, times: usize) {
        self.failures.push(error, times);
    }
}

#[async_trait]
impl TenantResolver for InMemoryTenantResolver {
    async fn resolve(&self, identifiers: &[String]) -> Result<TenantId, ProviderError> {
        self.failures.check()?;
        let tenants = self.tenants.lock().map_err(poisoned)?;
        identifiers
            .iter()
            .find_map(|id| tenants.get(id).copied())
            .or(self.fallback)
            .ok_or_else(|| ProviderError::Rejected(format!("no tenant for {identifiers:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issue_is_idempotent_per_key() {
        let provider = InMemoryRewardProvider::new();
        let recipient = Recipient::email("a@b.c");

        let first = provider.issue(500, &recipient, "k1").await.unwrap();
        let again = provider.issue(500, &recipient, "k1").await.unwrap();
        let other = provider.issue(500, &recipient, "k2").await.unwrap();

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(provider.instruments_issued(), 2);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn activation_replay_does_not_double_credit() {
        let provider = InMemoryRewardProvider::new();
        let id = provider.issue(500, &Recipient::default(), "i").await.unwrap();

        assert_eq!(provider.activate(&id, 500, "a").await.unwrap(), 500);
        assert_eq!(provider.activate(&id, 500, "a").await.unwrap(), 500);
    }

    #[tokio::test]
    async fn scripted_failures_run_out() {
        let provider = InMemoryRewardProvider::new();
        provider.fail_issue(ProviderError::Unavailable("503".into()), 2);
        let recipient = Recipient::email("a@b.c");

        assert!(provider.issue(500, &recipient, "k").await.is_err());
        assert!(provider.issue(500, &recipient, "k").await.is_err());
        assert!(provider.issue(500, &recipient, "k").await.is_ok());
        assert_eq!(provider.instruments_issued(), 1);
    }

    #[tokio::test]
    async fn resolver_prefers_first_known_identifier() {
        let fallback = TenantId::new();
        let acme = TenantId::new();
        let resolver = InMemoryTenantResolver::with_fallback(fallback);
        resolver.insert("acme", acme);

        let ids = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(resolver.resolve(&ids(&["acme", "sale-1"])).await.unwrap(), acme);
        assert_eq!(resolver.resolve(&ids(&["other"])).await.unwrap(), fallback);

        let strict = InMemoryTenantResolver::new();
        assert!(matches!(
            strict.resolve(&ids(&["x"])).await,
            Err(ProviderError::Rejected(_))
        ));
    }
}
