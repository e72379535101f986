//! Durable job queues with retry, backoff and a failed-job area.
//!
//! ## Design
//!
//! - Jobs live in a [`QueueStore`]; workers only hold a transient lease
//! - A claim is atomic: a job is `active` in at most one worker at a time
//! - Delivery is at-least-once (a crashed worker's lease expires and the job is
//!   claimed again), so handlers must be idempotent
//! - Failed attempts back off exponentially; exhausted jobs land in `failed`
//!   and stay there until an operator requeues them
//!
//! ## Components
//!
//! - `Job`: the record, its state machine and retry policy
//! - `QueueStore`: storage contract (in-memory here, Redis in `redis_store`)
//! - `QueueWorker`: claim/execute/resolve loop with bounded concurrency
//! - `WorkerPool`: binds queues to workers, drains them on shutdown
//! - `HandlerRegistry`: routes jobs to handlers by `kind`

pub mod handler;
pub mod messages;
pub mod pool;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod store;
pub mod types;
pub mod worker;

pub use handler::{FnHandler, HandlerRegistry, JobHandler, handler_fn};
pub use messages::{
    BROADCAST_KIND, BroadcastMessage, BroadcastMessageHandler, LogMessageHandler, MessageProducer,
    NOTIFICATION_KINDS, message_handlers,
};
pub use pool::{PoolError, ShutdownReport, WorkerHandle, WorkerPool};
#[cfg(feature = "redis")]
pub use redis_store::RedisQueueStore;
pub use store::{
    ClaimedJob, DEFAULT_COMPLETED_RETENTION, InMemoryQueueStore, QueueStats, QueueStore,
    QueueStoreError,
};
pub use types::{BackoffStrategy, DEFAULT_MAX_ATTEMPTS, Job, JobError, JobState, RetryPolicy};
pub use worker::{QueueWorker, WorkerOptions, WorkerStats, WorkerStatus};

/// Queue names used across the workspace.
pub mod queues {
    /// Audit events, one job per auditable action.
    pub const AUDIT_LOG: &str = "audit-log";
    /// Generic messages routed by job kind.
    pub const MESSAGES: &str = "messages";
}
