//! Generic message jobs: producer plus the stock handlers of the message worker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;

use fintrack_core::{ChannelName, JobId, QueueName};
use fintrack_events::Broadcaster;

use super::handler::{HandlerRegistry, JobHandler};
use super::store::{QueueStore, QueueStoreError};
use super::types::{DEFAULT_MAX_ATTEMPTS, Job, JobError};

/// Job kind of [`BroadcastMessageHandler`].
pub const BROADCAST_KIND: &str = "broadcast";

/// Kind pattern acknowledged by [`LogMessageHandler`].
pub const NOTIFICATION_KINDS: &str = "notification.*";

/// Stock routing of the message worker: `broadcast` jobs are published on
/// `bus`, `notification.*` jobs are logged. Other kinds fail without retry.
pub fn message_handlers(bus: Arc<dyn Broadcaster>) -> HandlerRegistry {
    HandlerRegistry::new()
        .with(BROADCAST_KIND, BroadcastMessageHandler::new(bus))
        .with(NOTIFICATION_KINDS, LogMessageHandler)
}

/// Enqueues message jobs on one queue.
#[derive(Clone)]
pub struct MessageProducer {
    store: Arc<dyn QueueStore>,
    queue: QueueName,
    max_attempts: u32,
}

impl MessageProducer {
    pub fn new(store: Arc<dyn QueueStore>, queue: QueueName) -> Self {
        Self {
            store,
            queue,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    /// Enqueue a message of `kind`, optionally held back for `delay`.
    pub async fn send(
        &self,
        kind: &str,
        payload: JsonValue,
        delay: Option<Duration>,
    ) -> Result<JobId, QueueStoreError> {
        let mut job = Job::new(self.queue.clone(), payload)
            .with_kind(kind)
            .with_max_attempts(self.max_attempts);
        if let Some(delay) = delay {
            job = job.delayed(delay);
        }
        self.store.enqueue(job).await
    }
}

/// Payload of a `broadcast` job: publish `payload` on `channel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub channel: ChannelName,
    pub payload: JsonValue,
}

/// Publishes a pub/sub message from a durable job, e.g. a signal that must go
/// out only after the enclosing write committed.
pub struct BroadcastMessageHandler {
    bus: Arc<dyn Broadcaster>,
}

impl BroadcastMessageHandler {
    pub fn new(bus: Arc<dyn Broadcaster>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl JobHandler for BroadcastMessageHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let message: BroadcastMessage = job.payload_as()?;
        self.bus.publish(&message.channel, message.payload).await;
        Ok(())
    }
}

/// Acknowledges a message by logging it.
#[derive(Debug, Default)]
pub struct LogMessageHandler;

#[async_trait]
impl JobHandler for LogMessageHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        info!(
            job_id = %job.id,
            kind = job.kind.as_deref().unwrap_or_default(),
            payload = %job.payload,
            "message delivered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use fintrack_events::InMemoryBroadcaster;

    use super::*;
    use crate::jobs::store::InMemoryQueueStore;
    use crate::jobs::types::JobState;

    #[tokio::test]
    async fn producer_stamps_kind_and_attempts() {
        let store = InMemoryQueueStore::arc();
        let producer = MessageProducer::new(store.clone(), QueueName::from_static("messages"))
            .with_max_attempts(7);

        let id = producer
            .send("notification.email", json!({"to": "a@b.c"}), None)
            .await
            .unwrap();
        let job = store.get(producer.queue(), id).await.unwrap().unwrap();
        assert_eq!(job.kind.as_deref(), Some("notification.email"));
        assert_eq!(job.max_attempts, 7);
        assert_eq!(job.state, JobState::Waiting);

        let delayed = producer
            .send("notification.email", json!({}), Some(Duration::from_secs(30)))
            .await
            .unwrap();
        let job = store.get(producer.queue(), delayed).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Delayed);
    }

    #[tokio::test]
    async fn broadcast_handler_publishes_the_payload() {
        let bus = Arc::new(InMemoryBroadcaster::new());
        let channel = ChannelName::from_static("fintrack:config:changed");
        let mut sub = bus.subscribe(&channel).await.unwrap();

        let handler = BroadcastMessageHandler::new(bus.clone());
        let job = Job::new(
            QueueName::from_static("messages"),
            json!({"channel": "fintrack:config:changed", "payload": {"k": 1}}),
        )
        .with_kind(BROADCAST_KIND);
        handler.handle(&job).await.unwrap();

        assert_eq!(sub.recv().await.unwrap().payload, json!({"k": 1}));
    }

    #[tokio::test]
    async fn stock_registry_routes_by_kind() {
        let registry = message_handlers(Arc::new(InMemoryBroadcaster::new()));
        let queue = QueueName::from_static("messages");

        let notification = Job::new(queue.clone(), json!({})).with_kind("notification.sms");
        assert!(registry.handle(&notification).await.is_ok());

        let unknown = Job::new(queue, json!({})).with_kind("invoice.render");
        assert!(matches!(registry.handle(&unknown).await, Err(JobError::Fatal(_))));
    }

    #[tokio::test]
    async fn malformed_broadcast_payload_is_fatal() {
        let handler = BroadcastMessageHandler::new(Arc::new(InMemoryBroadcaster::new()));
        let job = Job::new(QueueName::from_static("messages"), json!({"channel": ""}));

        assert!(matches!(
            handler.handle(&job).await,
            Err(JobError::Fatal(_))
        ));
    }
}
