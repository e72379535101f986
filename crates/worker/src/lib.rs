//! The worker process: consumes the audit-log and message queues and relays
//! pub/sub signals into its local event bridge.
//!
//! [`start`] is backend-agnostic; [`connect`] builds the production backends
//! (Redis queues and pub/sub, Postgres audit sink when `DATABASE_URL` is set).

use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

use fintrack_core::QueueName;
use fintrack_events::{Broadcaster, EventKind, LocalEventBridge};
use fintrack_infra::audit::{AuditLogHandler, AuditSink, InMemoryAuditLog, PostgresAuditLog};
use fintrack_infra::config::RuntimeConfig;
use fintrack_infra::event_bus::{BridgeRelay, RedisBroadcaster};
use fintrack_infra::jobs::{
    QueueStore, RedisQueueStore, ShutdownReport, WorkerPool, message_handlers, queues,
};

/// Backends the worker runs against.
pub struct Backends {
    pub queue_store: Arc<dyn QueueStore>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub audit_sink: Arc<dyn AuditSink>,
}

/// Connect the production backends described by `config`.
pub async fn connect(config: &RuntimeConfig) -> anyhow::Result<Backends> {
    let redis_url = config.require_redis_url()?;

    let queue_store = RedisQueueStore::connect(redis_url)
        .await
        .context("connecting queue store")?
        .with_completed_retention(config.completed_retention);
    let broadcaster = RedisBroadcaster::connect(redis_url)
        .await
        .context("connecting pub/sub broadcaster")?;

    let audit_sink: Arc<dyn AuditSink> = match &config.database_url {
        Some(database_url) => {
            let pool = sqlx::PgPool::connect(database_url)
                .await
                .context("connecting to Postgres")?;
            let sink = PostgresAuditLog::new(pool);
            sink.ensure_schema().await.context("creating audit schema")?;
            Arc::new(sink)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; audit entries are kept in memory only");
            Arc::new(InMemoryAuditLog::new())
        }
    };

    Ok(Backends {
        queue_store: Arc::new(queue_store),
        broadcaster: Arc::new(broadcaster),
        audit_sink,
    })
}

/// A running worker process.
pub struct WorkerRuntime {
    pool: WorkerPool,
    relay: BridgeRelay,
    bridge: LocalEventBridge,
    watcher: JoinHandle<()>,
}

/// Start the audit and message workers and the signal relay.
pub async fn start(config: &RuntimeConfig, backends: Backends) -> anyhow::Result<WorkerRuntime> {
    let mut pool = WorkerPool::new(backends.queue_store.clone())
        .with_defaults(config.worker_options())
        .with_notifier(backends.broadcaster.clone());

    pool.start_worker(
        vec![QueueName::from_static(queues::AUDIT_LOG)],
        config.audit_concurrency,
        Arc::new(AuditLogHandler::new(backends.audit_sink)),
    )
    .await
    .context("starting audit worker")?;

    pool.start_worker(
        config.message_queues.clone(),
        config.message_concurrency,
        Arc::new(message_handlers(backends.broadcaster.clone())),
    )
    .await
    .context("starting message worker")?;

    let bridge = LocalEventBridge::new();
    let relay = BridgeRelay::start(
        backends.broadcaster.as_ref(),
        bridge.clone(),
        &config.signal_channels,
    )
    .await
    .context("subscribing to signal channels")?;
    let watcher = tokio::spawn(log_signals(bridge.clone()));

    Ok(WorkerRuntime {
        pool,
        relay,
        bridge,
        watcher,
    })
}

impl WorkerRuntime {
    pub fn bridge(&self) -> &LocalEventBridge {
        &self.bridge
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Drain workers (bounded by `config.shutdown_timeout`), then stop relaying.
    pub async fn shutdown(self, config: &RuntimeConfig) -> ShutdownReport {
        let report = self.pool.shutdown(config.shutdown_timeout).await;
        self.relay.stop().await;
        self.bridge.close();
        if let Err(e) = self.watcher.await {
            tracing::warn!(error = %e, "signal log task ended abnormally");
        }
        report
    }
}

/// Surface relayed signals in the process log.
async fn log_signals(bridge: LocalEventBridge) {
    let mut events = bridge.observe_where(|event| event.is_remote());
    while let Some(event) = events.next().await {
        match event.kind {
            EventKind::State => {
                tracing::info!(topic = %event.topic, payload = %event.payload, "state signal received")
            }
            EventKind::Notification => {
                tracing::debug!(topic = %event.topic, "notification received")
            }
        }
    }
}
