use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::Extension, http::StatusCode, response::IntoResponse, routing::post, Json, Router,
};

use crate::app::dto::{JobAccepted, SendMessageRequest};
use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new().route("/", post(send_message))
}

/// POST /messages - enqueue a generic message job routed by `kind`.
pub async fn send_message(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<SendMessageRequest>,
) -> axum::response::Response {
    if body.kind.trim().is_empty() {
        return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", "kind must not be empty");
    }
    let Some(producer) = services.message_producer(body.queue.as_deref()) else {
        return errors::json_error(
            StatusCode::NOT_FOUND,
            "unknown_queue",
            format!("queue {:?} is not a message queue", body.queue.unwrap_or_default()),
        );
    };

    let delay = body.delay_secs.filter(|s| *s > 0).map(Duration::from_secs);
    match producer.send(&body.kind, body.payload, delay).await {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(JobAccepted {
                job_id,
                queue: producer.queue().clone(),
            }),
        )
            .into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}
