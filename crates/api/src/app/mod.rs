//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: infrastructure wiring (queue store, broadcaster, bridge, guard)
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router};
use tower::ServiceBuilder;

use fintrack_infra::config::RuntimeConfig;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub async fn build_app(config: RuntimeConfig) -> anyhow::Result<Router> {
    let services = Arc::new(services::build_services(config).await?);
    Ok(build_router(services))
}

/// Router over already-built services; callers keep `services` for shutdown.
pub fn build_router(services: Arc<AppServices>) -> Router {
    let idempotency = middleware::IdempotencyState::new(services.guard.clone());

    let commands = routes::commands().layer(axum::middleware::from_fn_with_state(
        idempotency,
        middleware::idempotency_middleware,
    ));

    Router::new()
        .merge(routes::queries())
        .merge(commands)
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
