//! Infrastructure layer: job queues and workers, audit ingestion, pub/sub
//! adapters, idempotency records and runtime configuration.

pub mod audit;
pub mod config;
pub mod event_bus;
pub mod idempotency;
pub mod jobs;

/// Redis connection wiring.
#[cfg(feature = "redis")]
pub mod redis_conn;
