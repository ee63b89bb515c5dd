use axum::{
    Router,
    routing::{get, post},
};

pub mod events;
pub mod jobs;
pub mod system;

/// Router for every endpoint except `/health`.
pub fn router() -> Router {
    Router::new()
        .route("/events", post(events::accept_event))
        .route("/jobs/status", get(jobs::status))
        .route("/jobs/reset", post(jobs::reset))
}
