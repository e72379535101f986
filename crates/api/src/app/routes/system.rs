use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::app::services::AppServices;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// GET /ready - 200 once the queue store answers, 503 otherwise.
pub async fn ready(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.queue_store.ping().await {
        Ok(()) => Json(json!({"status": "ready"})).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "unavailable", "message": e.to_string()})),
            )
                .into_response()
        }
    }
}
