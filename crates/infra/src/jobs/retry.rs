//! Retry policy and the controller that turns a failed attempt into either a
//! rescheduled job or a terminal error with a dead-letter entry.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::dead_letter::{DeadLetterEntry, DeadLetterSink, record_best_effort};
use super::store::{JobStore, JobStoreError};
use super::types::Job;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            other => Err(format!("unknown backoff strategy {other:?}")),
        }
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts a job gets before it is moved to `error`
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(15 * 60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay after the given failed attempt (1-indexed), capped at `max_delay`.
    ///
    /// Deterministic and non-decreasing in `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let raw = match self.strategy {
            BackoffStrategy::Fixed => Some(self.base_delay),
            BackoffStrategy::Exponential => 1u32
                .checked_shl(attempt - 1)
                .and_then(|factor| self.base_delay.checked_mul(factor)),
            BackoffStrategy::Linear => self.base_delay.checked_mul(attempt),
        };

        raw.unwrap_or(self.max_delay).min(self.max_delay)
    }

    /// Check if another attempt is allowed after `attempts` were used.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// How a failed attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Transient; `retry_after` is a lower bound hint from the dependency.
    Retryable { retry_after: Option<Duration> },
    /// Cannot succeed by retrying.
    Fatal,
}

impl FailureClass {
    pub fn retryable() -> Self {
        Self::Retryable { retry_after: None }
    }
}

/// What the controller did with the failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying { attempt: u32, at: DateTime<Utc> },
    DeadLettered { reason: String },
}

/// Decides retry vs. terminal failure and applies it to the store.
pub struct RetryController {
    store: Arc<dyn JobStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(
        store: Arc<dyn JobStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            dead_letters,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Apply a failure of the attempt `job` is currently leased for.
    ///
    /// `job.attempts` already counts the failed attempt (claim increments it).
    pub async fn handle_failure(
        &self,
        job: &Job,
        owner: &str,
        error: &str,
        class: FailureClass,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, JobStoreError> {
        match class {
            FailureClass::Retryable { retry_after } if !job.attempts_exhausted() => {
                let mut delay = self.policy.delay_for_attempt(job.attempts);
                if let Some(hint) = retry_after {
                    delay = delay.max(hint);
                }
                let at = now + to_chrono(delay);
                self.store.requeue(job.id, owner, at, error, now).await?;
                info!(
                    job_id = %job.id,
                    correlation_id = %job.correlation_id,
                    stage = %job.stage,
                    attempt = job.attempts,
                    retry_at = %at,
                    error,
                    "job attempt failed, retry scheduled"
                );
                Ok(FailureOutcome::Retrying {
                    attempt: job.attempts,
                    at,
                })
            }
            _ => {
                let failed = self.store.fail(job.id, owner, error, now).await?;
                warn!(
                    job_id = %job.id,
                    correlation_id = %job.correlation_id,
                    stage = %job.stage,
                    attempt = job.attempts,
                    fatal = matches!(class, FailureClass::Fatal),
                    error,
                    "job moved to error"
                );
                record_best_effort(
                    self.dead_letters.as_ref(),
                    DeadLetterEntry::from_job(&failed, error, now),
                )
                .await;
                Ok(FailureOutcome::DeadLettered {
                    reason: error.to_string(),
                })
            }
        }
    }
}

/// Saturating conversion; out-of-range delays fall back to the largest
/// representable chrono duration that is still safe to add to a timestamp.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}
