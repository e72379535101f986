//! Infrastructure wiring for the API process.
//!
//! In-memory mode (the default) keeps every store in process and runs the
//! audit and message workers in-process too, so the API works standalone for
//! dev/test. Persistent mode (`USE_PERSISTENT_STORES=true`, `redis` feature)
//! talks to Redis (queues, pub/sub, idempotency) and optionally Postgres
//! (idempotency records); a separate `fintrack-worker` process consumes the
//! queues.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Mutex;

use fintrack_core::QueueName;
use fintrack_events::{Broadcaster, InMemoryBroadcaster, LocalEventBridge};
use fintrack_infra::audit::{AuditLogHandler, AuditLogProducer, InMemoryAuditLog};
use fintrack_infra::config::RuntimeConfig;
use fintrack_infra::event_bus::BridgeRelay;
use fintrack_infra::idempotency::{IdempotencyGuard, IdempotencyStore, InMemoryIdempotencyStore};
use fintrack_infra::jobs::{
    InMemoryQueueStore, MessageProducer, QueueStore, WorkerPool, message_handlers, queues,
};

pub struct AppServices {
    pub config: RuntimeConfig,
    pub queue_store: Arc<dyn QueueStore>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub bridge: LocalEventBridge,
    pub audit: AuditLogProducer,
    pub guard: IdempotencyGuard,
    messages: Vec<MessageProducer>,
    relay: Mutex<Option<BridgeRelay>>,
    embedded_workers: Mutex<Option<WorkerPool>>,
}

impl AppServices {
    /// Producer for `queue`, or for the first configured message queue.
    pub fn message_producer(&self, queue: Option<&str>) -> Option<&MessageProducer> {
        match queue {
            Some(name) => self.messages.iter().find(|p| p.queue().as_str() == name),
            None => self.messages.first(),
        }
    }

    /// Resolve a queue name from a URL to one this deployment serves.
    pub fn known_queue(&self, name: &str) -> Option<QueueName> {
        if name == queues::AUDIT_LOG {
            return Some(self.audit.queue().clone());
        }
        self.config
            .message_queues
            .iter()
            .find(|q| q.as_str() == name)
            .cloned()
    }

    /// Stop relaying signals and drain in-process workers.
    pub async fn shutdown(&self) {
        if let Some(relay) = self.relay.lock().await.take() {
            relay.stop().await;
        }
        if let Some(pool) = self.embedded_workers.lock().await.take() {
            let report = pool.shutdown(self.config.shutdown_timeout).await;
            tracing::info!(?report, "embedded workers stopped");
        }
        self.bridge.close();
    }
}

pub async fn build_services(config: RuntimeConfig) -> anyhow::Result<AppServices> {
    if config.use_persistent_stores {
        #[cfg(feature = "redis")]
        {
            return build_persistent_services(config).await;
        }
        #[cfg(not(feature = "redis"))]
        {
            tracing::warn!(
                "USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory"
            );
        }
    }

    build_in_memory_services(config).await
}

async fn build_in_memory_services(config: RuntimeConfig) -> anyhow::Result<AppServices> {
    let queue_store: Arc<dyn QueueStore> =
        Arc::new(InMemoryQueueStore::new().with_completed_retention(config.completed_retention));
    let broadcaster: Arc<dyn Broadcaster> = Arc::new(InMemoryBroadcaster::new());
    let idempotency: Arc<dyn IdempotencyStore> = Arc::new(InMemoryIdempotencyStore::new());

    let mut pool = WorkerPool::new(queue_store.clone())
        .with_defaults(config.worker_options())
        .with_notifier(broadcaster.clone());
    pool.start_worker(
        vec![QueueName::from_static(queues::AUDIT_LOG)],
        config.audit_concurrency,
        Arc::new(AuditLogHandler::new(Arc::new(InMemoryAuditLog::new()))),
    )
    .await
    .context("starting in-process audit worker")?;
    pool.start_worker(
        config.message_queues.clone(),
        config.message_concurrency,
        Arc::new(message_handlers(broadcaster.clone())),
    )
    .await
    .context("starting in-process message worker")?;

    assemble(config, queue_store, broadcaster, idempotency, Some(pool)).await
}

#[cfg(feature = "redis")]
async fn build_persistent_services(config: RuntimeConfig) -> anyhow::Result<AppServices> {
    use fintrack_infra::event_bus::RedisBroadcaster;
    use fintrack_infra::idempotency::{PostgresIdempotencyStore, RedisIdempotencyStore};
    use fintrack_infra::jobs::RedisQueueStore;

    let redis_url = config.require_redis_url()?.to_string();

    let queue_store: Arc<dyn QueueStore> = Arc::new(
        RedisQueueStore::connect(&redis_url)
            .await
            .context("connecting queue store")?
            .with_completed_retention(config.completed_retention),
    );
    let broadcaster: Arc<dyn Broadcaster> = Arc::new(
        RedisBroadcaster::connect(&redis_url)
            .await
            .context("connecting pub/sub broadcaster")?,
    );

    let idempotency: Arc<dyn IdempotencyStore> = match &config.database_url {
        Some(database_url) => {
            let pool = sqlx::PgPool::connect(database_url)
                .await
                .context("connecting to Postgres")?;
            let store = PostgresIdempotencyStore::new(pool);
            store
                .ensure_schema()
                .await
                .context("creating idempotency schema")?;
            Arc::new(store)
        }
        None => Arc::new(
            RedisIdempotencyStore::connect(&redis_url)
                .await
                .context("connecting idempotency store")?,
        ),
    };

    assemble(config, queue_store, broadcaster, idempotency, None).await
}

async fn assemble(
    config: RuntimeConfig,
    queue_store: Arc<dyn QueueStore>,
    broadcaster: Arc<dyn Broadcaster>,
    idempotency: Arc<dyn IdempotencyStore>,
    embedded_workers: Option<WorkerPool>,
) -> anyhow::Result<AppServices> {
    let bridge = LocalEventBridge::new();
    let relay = BridgeRelay::start(broadcaster.as_ref(), bridge.clone(), &config.signal_channels)
        .await
        .context("subscribing to signal channels")?;

    let audit = AuditLogProducer::new(queue_store.clone()).with_max_attempts(config.job_max_attempts);
    let messages = config
        .message_queues
        .iter()
        .map(|queue| {
            MessageProducer::new(queue_store.clone(), queue.clone())
                .with_max_attempts(config.job_max_attempts)
        })
        .collect();
    let guard = IdempotencyGuard::new(idempotency, config.guard_config());

    Ok(AppServices {
        config,
        queue_store,
        broadcaster,
        bridge,
        audit,
        guard,
        messages,
        relay: Mutex::new(Some(relay)),
        embedded_workers: Mutex::new(embedded_workers),
    })
}
