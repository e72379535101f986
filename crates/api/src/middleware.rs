//! Idempotency middleware.
//!
//! Mutating requests (POST/PUT/PATCH/DELETE) must carry an `Idempotency-Key`.
//! The first request with a key runs the handler; its response (status, content
//! type, body) is stored and replayed verbatim to repeats, marked with
//! `Idempotency-Replayed: true`. 5xx responses are passed through without being
//! stored, so the client may retry under the same key.

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use fintrack_infra::idempotency::{
    Execution, IdempotencyGuard, IdempotencyKey, KeyError, RequestFingerprint,
};

use crate::app::errors;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const IDEMPOTENCY_REPLAYED_HEADER: &str = "idempotency-replayed";

const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct IdempotencyState {
    pub guard: IdempotencyGuard,
    pub max_body_bytes: usize,
}

impl IdempotencyState {
    pub fn new(guard: IdempotencyGuard) -> Self {
        Self {
            guard,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// The part of a response kept for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ResponseSnapshot {
    status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
    /// Base64 of the raw body bytes.
    body: String,
}

impl ResponseSnapshot {
    async fn capture(response: Response) -> Result<Self, Response> {
        let (parts, body) = response.into_parts();
        let bytes = axum::body::to_bytes(body, usize::MAX).await.map_err(|e| {
            errors::json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "response_unreadable",
                e.to_string(),
            )
        })?;
        Ok(Self {
            status: parts.status.as_u16(),
            content_type: parts
                .headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            body: BASE64.encode(&bytes),
        })
    }

    fn into_response(self, replayed: bool) -> Response {
        let Ok(body) = BASE64.decode(self.body.as_bytes()) else {
            return errors::json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "idempotency_record_corrupt",
                "stored response body is not valid base64",
            );
        };
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);

        let mut response = (status, Bytes::from(body)).into_response();
        let headers = response.headers_mut();
        headers.remove(header::CONTENT_TYPE);
        if let Some(value) = self.content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
            headers.insert(header::CONTENT_TYPE, value);
        }
        if replayed {
            headers.insert(IDEMPOTENCY_REPLAYED_HEADER, HeaderValue::from_static("true"));
        }
        response
    }
}

fn requires_key(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE)
}

fn extract_key(headers: &HeaderMap) -> Result<IdempotencyKey, KeyError> {
    match headers.get(IDEMPOTENCY_KEY_HEADER) {
        None => IdempotencyKey::parse(None),
        Some(value) => {
            let raw = value
                .to_str()
                .map_err(|_| KeyError::Invalid("header must be visible ASCII".into()))?;
            IdempotencyKey::parse(Some(raw))
        }
    }
}

pub async fn idempotency_middleware(
    State(state): State<IdempotencyState>,
    req: Request,
    next: Next,
) -> Response {
    if !requires_key(req.method()) {
        return next.run(req).await;
    }

    let key = match extract_key(req.headers()) {
        Ok(key) => key,
        Err(e) => return errors::key_error_to_response(e),
    };

    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return errors::json_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload_too_large",
                format!("request body exceeds {} bytes", state.max_body_bytes),
            );
        }
    };
    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| parts.uri.path());
    let fingerprint = RequestFingerprint::compute(parts.method.as_str(), target, &bytes);
    let req = Request::from_parts(parts, Body::from(bytes));

    let outcome = state
        .guard
        .execute(&key, &fingerprint, || async move {
            let response = next.run(req).await;
            if response.status().is_server_error() {
                return Err(response);
            }
            ResponseSnapshot::capture(response).await
        })
        .await;

    match outcome {
        Ok(Execution::Fresh(snapshot)) => snapshot.into_response(false),
        Ok(Execution::Replayed(snapshot)) => {
            tracing::debug!(key = %key, "replaying idempotent response");
            snapshot.into_response(true)
        }
        Err(e) => errors::idempotency_error_to_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_mutating_methods_need_a_key() {
        assert!(requires_key(&Method::POST));
        assert!(requires_key(&Method::DELETE));
        assert!(!requires_key(&Method::GET));
        assert!(!requires_key(&Method::HEAD));
    }

    #[test]
    fn header_keys_are_validated() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_key(&headers), Err(KeyError::Missing));

        headers.insert(IDEMPOTENCY_KEY_HEADER, HeaderValue::from_static("k1"));
        assert_eq!(extract_key(&headers).unwrap().as_str(), "k1");

        headers.insert(
            IDEMPOTENCY_KEY_HEADER,
            HeaderValue::from_bytes(b"caf\xc3\xa9").unwrap(),
        );
        assert!(matches!(extract_key(&headers), Err(KeyError::Invalid(_))));
    }

    #[tokio::test]
    async fn snapshots_replay_status_type_and_body() {
        let original = errors::json_error(StatusCode::ACCEPTED, "queued", "ok");
        let snapshot = ResponseSnapshot::capture(original).await.unwrap();
        assert_eq!(snapshot.status, 202);
        assert_eq!(snapshot.content_type.as_deref(), Some("application/json"));

        let replayed = snapshot.clone().into_response(true);
        assert_eq!(replayed.status(), StatusCode::ACCEPTED);
        assert_eq!(replayed.headers()[IDEMPOTENCY_REPLAYED_HEADER], "true");
        let body = axum::body::to_bytes(replayed.into_body(), usize::MAX).await.unwrap();
        assert_eq!(BASE64.encode(&body), snapshot.body);
    }
}
