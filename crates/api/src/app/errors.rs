use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use rewardflow_infra::jobs::{EnqueueError, JobStoreError};
use rewardflow_infra::runs::RunStoreError;

pub fn enqueue_error_to_response(err: EnqueueError) -> axum::response::Response {
    match err {
        EnqueueError::Invalid(e) => json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
        EnqueueError::UnknownTrigger(kind) => json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "unknown_trigger",
            format!("no reward program for trigger type {kind:?}"),
        ),
        EnqueueError::Jobs(e) => store_error_to_response(e),
        EnqueueError::Runs(RunStoreError::Contention(msg)) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "contention", msg)
        }
        EnqueueError::Runs(e) => {
            error!(error = %e, "run store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
}

pub fn store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::Contention(msg) => json_error(StatusCode::SERVICE_UNAVAILABLE, "contention", msg),
        JobStoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        JobStoreError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
        other => {
            error!(error = %other, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", other.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
