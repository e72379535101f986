//! Request/response DTOs (JSON, camelCase).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use fintrack_core::{ChannelName, JobId, QueueName};
use fintrack_infra::jobs::{Job, JobState, QueueStats};

// ─────────────────────────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeSessionRequest {
    pub actor_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigChangeRequest {
    pub key: String,
    pub value: JsonValue,
    pub actor_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub kind: String,
    #[serde(default)]
    pub payload: JsonValue,
    /// Defaults to the first configured message queue.
    pub queue: Option<String>,
    pub delay_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequeueRequest {
    pub extra_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FailedJobsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventStreamQuery {
    pub topic: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Responses
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAccepted {
    pub job_id: JobId,
    pub queue: QueueName,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPublished {
    pub channel: ChannelName,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_job_id: Option<JobId>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatsView {
    pub queue: QueueName,
    #[serde(flatten)]
    pub stats: QueueStats,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: JobId,
    pub queue: QueueName,
    pub kind: Option<String>,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            queue: job.queue,
            kind: job.kind,
            state: job.state,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            last_error: job.last_error,
            payload: job.payload,
            created_at: job.created_at,
            updated_at: job.updated_at,
            run_at: job.run_at,
            processed_at: job.processed_at,
        }
    }
}
