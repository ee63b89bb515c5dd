//! HTTP API: trigger intake, job status and admin reset, plus process wiring.

pub mod app;
pub mod middleware;
