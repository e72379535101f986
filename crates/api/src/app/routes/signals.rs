//! Endpoints that publish cross-process signals.
//!
//! Publishing is best effort; the accompanying audit event is the durable record.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use fintrack_events::{AuditAction, AuditEvent, Signal};

use crate::app::dto::{ConfigChangeRequest, RevokeSessionRequest, SignalPublished};
use crate::app::{errors, services::AppServices};

/// Actor recorded when a request does not name one.
const SYSTEM_ACTOR: &str = "system";

async fn publish(
    services: &AppServices,
    signal: Signal,
    audit: AuditEvent,
) -> axum::response::Response {
    let audit_job_id = match services.audit.record(&audit).await {
        Ok(id) => id,
        Err(e) => return errors::queue_error_to_response(e),
    };

    let channel = signal.channel();
    services.broadcaster.publish(&channel, signal.to_payload()).await;

    (
        StatusCode::ACCEPTED,
        Json(SignalPublished {
            channel,
            topic: signal.topic(),
            audit_job_id: Some(audit_job_id),
        }),
    )
        .into_response()
}

/// POST /sessions/:session_id/revoke
pub async fn revoke_session(
    Extension(services): Extension<Arc<AppServices>>,
    Path(session_id): Path<String>,
    body: Option<Json<RevokeSessionRequest>>,
) -> axum::response::Response {
    let Json(body) = body.unwrap_or_default();
    let actor = body.actor_id.clone().unwrap_or_else(|| SYSTEM_ACTOR.to_string());

    let audit = AuditEvent::new(AuditAction::TokenRevoked, actor)
        .with_context(json!({ "sessionId": session_id }));
    let signal = Signal::TokenRevoked {
        session_id,
        actor_id: body.actor_id,
    };
    publish(&services, signal, audit).await
}

/// POST /config
pub async fn change_config(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<ConfigChangeRequest>,
) -> axum::response::Response {
    if body.key.trim().is_empty() {
        return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", "key must not be empty");
    }

    let actor = body.actor_id.unwrap_or_else(|| SYSTEM_ACTOR.to_string());
    let audit = AuditEvent::new(AuditAction::ConfigChanged, actor)
        .with_context(json!({ "key": body.key, "value": body.value }));
    let signal = Signal::ConfigChanged {
        key: body.key,
        value: body.value,
    };
    publish(&services, signal, audit).await
}
