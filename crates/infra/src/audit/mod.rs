//! Audit-log ingestion: producer, queue handler and sinks.
//!
//! Producers enqueue one [`AuditEvent`] per job on the `audit-log` queue; the
//! audit worker writes each event to an [`AuditSink`] keyed by job id, so a
//! redelivered job is recorded once.

pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use fintrack_core::{JobId, QueueName};
use fintrack_events::AuditEvent;

use crate::jobs::{DEFAULT_MAX_ATTEMPTS, Job, JobError, JobHandler, QueueStore, QueueStoreError, queues};

pub use postgres::PostgresAuditLog;

/// Audit sink error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuditSinkError {
    #[error("audit storage error: {0}")]
    Storage(String),
}

/// A persisted audit entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub job_id: JobId,
    pub event: AuditEvent,
    pub recorded_at: DateTime<Utc>,
}

/// Durable destination of audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Record `event` under `job_id`. Returns `false` when an entry for the job
    /// already exists (redelivery), in which case nothing is written.
    async fn record(&self, job_id: JobId, event: &AuditEvent) -> Result<bool, AuditSinkError>;
}

/// In-memory audit sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditLog {
    async fn record(&self, job_id: JobId, event: &AuditEvent) -> Result<bool, AuditSinkError> {
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.job_id == job_id) {
            return Ok(false);
        }
        entries.push(AuditEntry {
            job_id,
            event: event.clone(),
            recorded_at: Utc::now(),
        });
        Ok(true)
    }
}

/// Queue handler of the audit-log worker.
pub struct AuditLogHandler {
    sink: Arc<dyn AuditSink>,
}

impl AuditLogHandler {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl JobHandler for AuditLogHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let event: AuditEvent = job.payload_as()?;
        let inserted = self
            .sink
            .record(job.id, &event)
            .await
            .map_err(|e| JobError::failed(e.to_string()))?;

        if !inserted {
            debug!(job_id = %job.id, "audit event already recorded");
        }
        Ok(())
    }
}

/// Enqueues audit events on the audit-log queue.
#[derive(Clone)]
pub struct AuditLogProducer {
    store: Arc<dyn QueueStore>,
    queue: QueueName,
    max_attempts: u32,
}

impl AuditLogProducer {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            queue: QueueName::from_static(queues::AUDIT_LOG),
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

    pub async fn record(&self, event: &AuditEvent) -> Result<JobId, QueueStoreError> {
        let payload = serde_json::to_value(event)
            .map_err(|e| QueueStoreError::Serialization(e.to_string()))?;
        let job = Job::new(self.queue.clone(), payload)
            .with_kind(format!("audit.{}", event.action))
            .with_max_attempts(self.max_attempts);
        self.store.enqueue(job).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use fintrack_events::AuditAction;

    use super::*;
    use crate::jobs::InMemoryQueueStore;

    #[tokio::test]
    async fn redelivered_jobs_are_recorded_once() {
        let sink = Arc::new(InMemoryAuditLog::new());
        let handler = AuditLogHandler::new(sink.clone());
        let job = Job::new(
            QueueName::from_static(queues::AUDIT_LOG),
            json!({"action": "login", "actorId": "u1"}),
        );

        handler.handle(&job).await.unwrap();
        handler.handle(&job).await.unwrap();

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].job_id, job.id);
        assert_eq!(entries[0].event.action, AuditAction::Login);
        assert_eq!(entries[0].event.actor_id, "u1");
    }

    #[tokio::test]
    async fn malformed_events_fail_fatally() {
        let handler = AuditLogHandler::new(Arc::new(InMemoryAuditLog::new()));
        let job = Job::new(
            QueueName::from_static(queues::AUDIT_LOG),
            json!({"action": "teleport", "actorId": "u1"}),
        );

        assert!(matches!(handler.handle(&job).await, Err(JobError::Fatal(_))));
    }

    struct BrokenSink;

    #[async_trait]
    impl AuditSink for BrokenSink {
        async fn record(&self, _job_id: JobId, _event: &AuditEvent) -> Result<bool, AuditSinkError> {
            Err(AuditSinkError::Storage("database unavailable".into()))
        }
    }

    #[tokio::test]
    async fn sink_outages_are_retryable() {
        let handler = AuditLogHandler::new(Arc::new(BrokenSink));
        let job = Job::new(
            QueueName::from_static(queues::AUDIT_LOG),
            json!({"action": "logout", "actorId": "u1"}),
        );

        assert!(matches!(handler.handle(&job).await, Err(JobError::Failed(_))));
    }

    #[tokio::test]
    async fn producer_enqueues_on_the_audit_queue() {
        let store = InMemoryQueueStore::arc();
        let producer = AuditLogProducer::new(store.clone()).with_max_attempts(3);

        let id = producer
            .record(&AuditEvent::new(AuditAction::RoleAssigned, "admin"))
            .await
            .unwrap();

        let job = store.get(producer.queue(), id).await.unwrap().unwrap();
        assert_eq!(job.kind.as_deref(), Some("audit.role_assigned"));
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.payload["actorId"], "admin");
    }
}
