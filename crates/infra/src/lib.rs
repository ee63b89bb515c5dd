//! Infrastructure layer: durable job engine, stores, provider adapters, config.

pub mod config;
pub mod db;
pub mod jobs;
pub mod providers;
pub mod runs;

#[cfg(test)]
mod integration_tests;
