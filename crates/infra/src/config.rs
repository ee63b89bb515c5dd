//! Configuration loading and representation.
//!
//! Everything comes from environment variables with dev-friendly defaults.
//! Missing optional sections (database, provider URLs) switch the process to
//! in-memory stand-ins rather than failing.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::jobs::enqueue::RewardProgram;
use crate::jobs::retry::{BackoffStrategy, RetryPolicy};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoints {
    pub reward_url: Option<String>,
    pub notification_url: Option<String>,
    pub tenant_resolver_url: Option<String>,
    pub timeout: Duration,
}

/// Full engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Lease owner name written into claimed rows.
    pub worker_id: String,
    pub database: Option<DatabaseConfig>,
    pub claim_batch_size: usize,
    pub poll_interval: Duration,
    /// A running job whose lease is at least this old is reclaimed.
    pub lease_timeout: Duration,
    /// Age after which a lease shows up as stuck in status and reset.
    pub stuck_threshold: Duration,
    pub reaper_interval: Duration,
    pub retry: RetryPolicy,
    pub providers: ProviderEndpoints,
    pub programs: HashMap<String, RewardProgram>,
    pub http_bind: String,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let worker_id = get("WORKER_ID").unwrap_or_else(default_worker_id);

        let database = match get("DATABASE_URL") {
            Some(url) => Some(DatabaseConfig {
                url,
                max_connections: parse_or(&get, "DATABASE_MAX_CONNECTIONS", 10)?,
                acquire_timeout_secs: parse_or(&get, "DATABASE_ACQUIRE_TIMEOUT_SECS", 5)?,
            }),
            None => None,
        };

        let claim_batch_size: usize = parse_or(&get, "CLAIM_BATCH_SIZE", 8)?;
        if claim_batch_size == 0 {
            return Err(invalid("CLAIM_BATCH_SIZE", "0", "must be at least 1"));
        }

        let max_attempts: u32 = parse_or(&get, "MAX_ATTEMPTS", 5)?;
        if max_attempts == 0 {
            return Err(invalid("MAX_ATTEMPTS", "0", "must be at least 1"));
        }

        let strategy = match get("BACKOFF_STRATEGY") {
            None => BackoffStrategy::Exponential,
            Some(raw) => raw
                .parse()
                .map_err(|reason| invalid("BACKOFF_STRATEGY", &raw, reason))?,
        };

        let base_delay = Duration::from_millis(parse_or(&get, "BACKOFF_BASE_MS", 2_000)?);
        let max_delay = Duration::from_secs(parse_or(&get, "BACKOFF_MAX_SECS", 900)?);
        if max_delay < base_delay {
            return Err(invalid(
                "BACKOFF_MAX_SECS",
                &max_delay.as_secs().to_string(),
                "must not be below BACKOFF_BASE_MS",
            ));
        }

        let lease_timeout = Duration::from_secs(parse_or(&get, "LEASE_TIMEOUT_SECS", 300)?);
        let stuck_threshold =
            Duration::from_secs(parse_or(&get, "STUCK_THRESHOLD_SECS", lease_timeout.as_secs())?);

        let programs = match get("REWARD_PROGRAMS_JSON") {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| invalid("REWARD_PROGRAMS_JSON", &raw, e.to_string()))?,
            None => default_programs(),
        };

        Ok(Self {
            worker_id,
            database,
            claim_batch_size,
            poll_interval: Duration::from_millis(parse_or(&get, "POLL_INTERVAL_MS", 1_000)?),
            lease_timeout,
            stuck_threshold,
            reaper_interval: Duration::from_secs(parse_or(&get, "REAPER_INTERVAL_SECS", 30)?),
            retry: RetryPolicy {
                max_attempts,
                base_delay,
                max_delay,
                strategy,
            },
            providers: ProviderEndpoints {
                reward_url: get("REWARD_PROVIDER_URL"),
                notification_url: get("NOTIFICATION_PROVIDER_URL"),
                tenant_resolver_url: get("TENANT_RESOLVER_URL"),
                timeout: Duration::from_millis(parse_or(&get, "PROVIDER_TIMEOUT_MS", 10_000)?),
            },
            programs,
            http_bind: get("HTTP_BIND").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, &raw, e.to_string())),
    }
}

fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn default_worker_id() -> String {
    format!("worker-{}", uuid::Uuid::now_v7())
}

/// Programs used when `REWARD_PROGRAMS_JSON` is not set.
pub fn default_programs() -> HashMap<String, RewardProgram> {
    HashMap::from([
        (
            "reservation.created".to_string(),
            RewardProgram::new(500, "email", "reservation_reward"),
        ),
        (
            "sale.completed".to_string(),
            RewardProgram::new(1_000, "email", "sale_reward"),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_run_in_memory() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();

        assert!(config.database.is_none());
        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.lease_timeout, Duration::from_secs(300));
        assert_eq!(config.stuck_threshold, config.lease_timeout);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.programs.contains_key("sale.completed"));
    }

    #[test]
    fn reads_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("WORKER_ID", "w-1"),
            ("DATABASE_URL", "postgres://localhost/rewards"),
            ("CLAIM_BATCH_SIZE", "3"),
            ("BACKOFF_STRATEGY", "linear"),
            ("LEASE_TIMEOUT_SECS", "60"),
        ]))
        .unwrap();

        assert_eq!(config.worker_id, "w-1");
        assert_eq!(config.database.unwrap().max_connections, 10);
        assert_eq!(config.claim_batch_size, 3);
        assert_eq!(config.retry.strategy, BackoffStrategy::Linear);
        assert_eq!(config.stuck_threshold, Duration::from_secs(60));
    }

    #[test]
    fn rejects_garbage_numbers() {
        let err = EngineConfig::from_lookup(lookup(&[("MAX_ATTEMPTS", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MAX_ATTEMPTS", .. }));
    }

    #[test]
    fn rejects_zero_batch() {
        assert!(EngineConfig::from_lookup(lookup(&[("CLAIM_BATCH_SIZE", "0")])).is_err());
    }

    #[test]
    fn parses_program_table() {
        let config = EngineConfig::from_lookup(lookup(&[(
            "REWARD_PROGRAMS_JSON",
            r#"{"booking.paid":{"amount_cents":250,"channel":"sms","template":"paid"}}"#,
        )]))
        .unwrap();

        assert_eq!(config.programs.len(), 1);
        assert_eq!(config.programs["booking.paid"].amount_cents, 250);
    }
}
