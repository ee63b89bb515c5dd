//! Operator repair: put error and stuck jobs back in the queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::retry::to_chrono;
use super::store::{JobStore, JobStoreError};

/// Which categories to reset. Neither flag set, or both, means both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "ResetFlags")]
pub struct ResetFilter {
    pub error_only: bool,
    pub stuck_only: bool,
}

/// Wire form; `failedOnly` is another name for `errorOnly` and either may be
/// sent, alone or together.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ResetFlags {
    error_only: bool,
    failed_only: bool,
    stuck_only: bool,
}

impl From<ResetFlags> for ResetFilter {
    fn from(flags: ResetFlags) -> Self {
        Self {
            error_only: flags.error_only || flags.failed_only,
            stuck_only: flags.stuck_only,
        }
    }
}

impl ResetFilter {
    pub fn errors() -> Self {
        Self {
            error_only: true,
            stuck_only: false,
        }
    }

    pub fn stuck() -> Self {
        Self {
            error_only: false,
            stuck_only: true,
        }
    }

    fn includes_errors(&self) -> bool {
        self.error_only || !self.stuck_only
    }

    fn includes_stuck(&self) -> bool {
        self.stuck_only || !self.error_only
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetReport {
    pub error_reset: u64,
    pub stuck_reset: u64,
}

pub struct JobAdmin {
    store: Arc<dyn JobStore>,
    stuck_threshold: Duration,
}

impl JobAdmin {
    pub fn new(store: Arc<dyn JobStore>, stuck_threshold: Duration) -> Self {
        Self {
            store,
            stuck_threshold,
        }
    }

    /// Error jobs restart with zero attempts; stuck jobs keep theirs.
    pub async fn reset(&self, filter: ResetFilter, now: DateTime<Utc>) -> Result<ResetReport, JobStoreError> {
        let mut report = ResetReport::default();
        if filter.includes_errors() {
            report.error_reset = self.store.reset_errors(now).await?;
        }
        if filter.includes_stuck() {
            let cutoff = now - to_chrono(self.stuck_threshold);
            report.stuck_reset = self.store.reset_stuck(cutoff, now).await?;
        }
        info!(
            error_reset = report.error_reset,
            stuck_reset = report.stuck_reset,
            error_only = filter.error_only,
            stuck_only = filter.stuck_only,
            "jobs reset"
        );
        Ok(report)
    }
}
