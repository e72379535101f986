use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use fintrack_infra::idempotency::{IdempotencyError, KeyError};
use fintrack_infra::jobs::QueueStoreError;

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn key_error_to_response(err: KeyError) -> Response {
    match err {
        KeyError::Missing => json_error(
            StatusCode::BAD_REQUEST,
            "missing_idempotency_key",
            "mutating requests require an Idempotency-Key header",
        ),
        KeyError::Invalid(reason) => {
            json_error(StatusCode::BAD_REQUEST, "invalid_idempotency_key", reason)
        }
    }
}

/// `Operation` carries the handler's own response, which is returned unchanged.
pub fn idempotency_error_to_response(err: IdempotencyError<Response>) -> Response {
    match err {
        IdempotencyError::Operation(response) => response,
        IdempotencyError::MissingKey => key_error_to_response(KeyError::Missing),
        IdempotencyError::InvalidKey(reason) => key_error_to_response(KeyError::Invalid(reason)),
        IdempotencyError::KeyConflict { key } => json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "idempotency_key_conflict",
            format!("idempotency key `{key}` was already used for a different request"),
        ),
        IdempotencyError::RequestInProgress { key } => json_error(
            StatusCode::CONFLICT,
            "request_in_progress",
            format!("a request with idempotency key `{key}` is still being processed"),
        ),
        IdempotencyError::Store(e) => {
            tracing::error!(error = %e, "idempotency store unavailable");
            json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "idempotency_store_unavailable",
                "idempotency records are temporarily unavailable; retry later",
            )
        }
        IdempotencyError::Serialization(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "idempotency_record_corrupt", msg)
        }
    }
}

pub fn queue_error_to_response(err: QueueStoreError) -> Response {
    match err {
        QueueStoreError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "job_not_found", format!("job {id} not found"))
        }
        QueueStoreError::InvalidState { id, state, expected } => json_error(
            StatusCode::CONFLICT,
            "invalid_job_state",
            format!("job {id} is {state}, expected {expected}"),
        ),
        QueueStoreError::AlreadyExists(id) => {
            json_error(StatusCode::CONFLICT, "job_exists", format!("job {id} already exists"))
        }
        QueueStoreError::Connection(msg) => {
            tracing::error!(error = %msg, "queue store unavailable");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable", msg)
        }
        other => {
            tracing::error!(error = %other, "queue store error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "queue_error", other.to_string())
        }
    }
}
