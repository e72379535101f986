use axum::{
    routing::{get, post},
    Router,
};

pub mod admin;
pub mod audit;
pub mod event_stream;
pub mod messages;
pub mod signals;
pub mod system;

/// Mutating endpoints; mounted behind the idempotency middleware.
pub fn commands() -> Router {
    Router::new()
        .nest("/audit-events", audit::router())
        .nest("/messages", messages::router())
        .route("/sessions/:session_id/revoke", post(signals::revoke_session))
        .route("/config", post(signals::change_config))
        .nest("/admin", admin::router())
}

/// Read-only endpoints.
pub fn queries() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/ready", get(system::ready))
        .nest("/events", event_stream::router())
}
