use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;

use rewardflow_infra::jobs::ResetFilter;

use crate::app::{dto::StatusQuery, errors, services::AppServices};

/// GET /jobs/status?limit=
pub async fn status(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<StatusQuery>,
) -> axum::response::Response {
    match services.status.report(query.limit(), Utc::now()).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// POST /jobs/reset?errorOnly=&stuckOnly= (`failedOnly` is an alias of `errorOnly`)
pub async fn reset(
    Extension(services): Extension<Arc<AppServices>>,
    Query(filter): Query<ResetFilter>,
) -> axum::response::Response {
    match services.admin.reset(filter, Utc::now()).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
