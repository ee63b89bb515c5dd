use std::sync::Arc;

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};
use chrono::Utc;

use rewardflow_events::TriggerEvent;

use crate::app::{errors, services::AppServices};

/// POST /events - acknowledge a trigger delivery.
///
/// 202 means the delivery is durably recorded; it says nothing about how the
/// job will end.
pub async fn accept_event(
    Extension(services): Extension<Arc<AppServices>>,
    Json(event): Json<TriggerEvent>,
) -> axum::response::Response {
    match services.enqueuer.accept(&event, Utc::now()).await {
        Ok(outcome) => (StatusCode::ACCEPTED, Json(outcome)).into_response(),
        Err(e) => errors::enqueue_error_to_response(e),
    }
}
