//! Time source for job processing.

use chrono::{DateTime, Utc};

/// Where "now" comes from while a claimed job runs.
///
/// `System` reads the wall clock at every claim, commit and failure, so a
/// retry is scheduled from when the attempt ended. `Fixed` pins every
/// timestamp to one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    System,
    Fixed(DateTime<Utc>),
}

impl Clock {
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Fixed(at) => *at,
        }
    }
}

impl From<DateTime<Utc>> for Clock {
    fn from(at: DateTime<Utc>) -> Self {
        Clock::Fixed(at)
    }
}
