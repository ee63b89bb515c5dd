//! `rewardflow-core` — shared building blocks.
//!
//! Identifiers and the domain error model. No infrastructure concerns live here.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, TenantId};
