//! Audit event ingestion.

use std::sync::Arc;

use axum::{
    extract::Extension, http::StatusCode, response::IntoResponse, routing::post, Json, Router,
};

use fintrack_events::AuditEvent;

use crate::app::dto::JobAccepted;
use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new().route("/", post(record_event))
}

/// POST /audit-events - enqueue one audit event; 202 with the job id.
pub async fn record_event(
    Extension(services): Extension<Arc<AppServices>>,
    Json(event): Json<AuditEvent>,
) -> axum::response::Response {
    match services.audit.record(&event).await {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(JobAccepted {
                job_id,
                queue: services.audit.queue().clone(),
            }),
        )
            .into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}
