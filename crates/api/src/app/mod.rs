//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: stores, providers, worker/reaper assembly
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: query DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<AppServices>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(
            ServiceBuilder::new()
                .layer(middleware::trace_layer())
                .layer(Extension(services)),
        )
}
