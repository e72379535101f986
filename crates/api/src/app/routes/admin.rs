//! Operator routes: queue statistics and the failed-job area.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use fintrack_core::{JobId, QueueName};

use crate::app::dto::{FailedJobsQuery, JobView, QueueStatsView, RequeueRequest};
use crate::app::{errors, services::AppServices};

const DEFAULT_FAILED_LIMIT: usize = 50;
const MAX_FAILED_LIMIT: usize = 500;

pub fn router() -> Router {
    Router::new()
        .route("/queues/:queue/stats", get(queue_stats))
        .route("/queues/:queue/failed", get(failed_jobs))
        .route("/queues/:queue/jobs/:id/requeue", post(requeue_job))
}

fn resolve_queue(services: &AppServices, name: &str) -> Result<QueueName, axum::response::Response> {
    services.known_queue(name).ok_or_else(|| {
        errors::json_error(
            StatusCode::NOT_FOUND,
            "unknown_queue",
            format!("queue {name:?} is not served here"),
        )
    })
}

/// GET /admin/queues/:queue/stats
pub async fn queue_stats(
    Extension(services): Extension<Arc<AppServices>>,
    Path(queue): Path<String>,
) -> axum::response::Response {
    let queue = match resolve_queue(&services, &queue) {
        Ok(q) => q,
        Err(resp) => return resp,
    };
    match services.queue_store.stats(&queue).await {
        Ok(stats) => Json(QueueStatsView { queue, stats }).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// GET /admin/queues/:queue/failed?limit=N
pub async fn failed_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Path(queue): Path<String>,
    Query(query): Query<FailedJobsQuery>,
) -> axum::response::Response {
    let queue = match resolve_queue(&services, &queue) {
        Ok(q) => q,
        Err(resp) => return resp,
    };
    let limit = query.limit.unwrap_or(DEFAULT_FAILED_LIMIT).min(MAX_FAILED_LIMIT);

    match services.queue_store.list_failed(&queue, limit).await {
        Ok(jobs) => Json(jobs.into_iter().map(JobView::from).collect::<Vec<_>>()).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// POST /admin/queues/:queue/jobs/:id/requeue
///
/// Moves a failed job back to waiting with `extraAttempts` (default 1) more
/// attempts than it has used.
pub async fn requeue_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path((queue, id)): Path<(String, String)>,
    body: Option<Json<RequeueRequest>>,
) -> axum::response::Response {
    let queue = match resolve_queue(&services, &queue) {
        Ok(q) => q,
        Err(resp) => return resp,
    };
    let id: JobId = match id.parse() {
        Ok(id) => id,
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_job_id", "job id must be a UUID");
        }
    };
    let Json(body) = body.unwrap_or_default();
    let extra = body.extra_attempts.unwrap_or(1).max(1);

    match services.queue_store.requeue_failed(&queue, id, extra).await {
        Ok(job) => {
            tracing::info!(job_id = %id, queue = %queue, extra_attempts = extra, "failed job requeued");
            Json(JobView::from(job)).into_response()
        }
        Err(e) => errors::queue_error_to_response(e),
    }
}
