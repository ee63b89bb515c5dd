//! Inbound business events.
//!
//! Triggers arrive at least once, possibly duplicated or reordered. This crate
//! only describes them; deduplication and job creation live in the infra layer.

pub mod recipient;
pub mod trigger;

pub use recipient::Recipient;
pub use trigger::{CorrelationId, TriggerEvent, TriggerType};
