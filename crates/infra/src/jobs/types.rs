//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use fintrack_core::{JobId, QueueName};

/// Default ceiling on execution attempts for a new job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Eligible to be claimed now
    Waiting,
    /// Claimed by a worker holding a lease
    Active,
    /// Handler succeeded (terminal)
    Completed,
    /// Attempts exhausted or fatal error (terminal, inspectable)
    Failed,
    /// Waiting for `run_at`
    Delayed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobState::Waiting),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "delayed" => Some(JobState::Delayed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^attempts
    #[default]
    Exponential,
    /// Linear backoff: base * attempts
    Linear,
}

/// Retry policy.
///
/// `max_attempts` is stamped onto jobs by producers; the delay settings are
/// applied by workers when an attempt fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0), applied symmetrically around the computed delay
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay before the next attempt of a job that has run `attempts` times.
    ///
    /// Never exceeds `max_delay`, jitter included.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => base_ms * 2_f64.powi(attempts.min(62) as i32),
            BackoffStrategy::Linear => base_ms * f64::from(attempts.max(1)),
        }
        .min(max_ms);

        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms) as u64)
    }

    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// A durable unit of background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: QueueName,
    /// Routing key for handler registries (e.g. `notification.email`)
    pub kind: Option<String>,
    /// Opaque JSON payload
    pub payload: JsonValue,
    pub state: JobState,
    /// Execution attempts so far; incremented on every claim
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When a waiting/delayed job becomes due
    pub run_at: DateTime<Utc>,
    /// Set when the job reaches a terminal state
    pub processed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(queue: QueueName, payload: JsonValue) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            queue,
            kind: None,
            payload,
            state: JobState::Waiting,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            last_error: None,
            created_at: now,
            updated_at: now,
            run_at: now,
            processed_at: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Set the attempt ceiling (at least one attempt is always made).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Hold the job back for `delay` after enqueue.
    pub fn delayed(mut self, delay: Duration) -> Self {
        if !delay.is_zero() {
            self.run_at = self.created_at + to_chrono(delay);
            self.state = JobState::Delayed;
        }
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, JobState::Waiting | JobState::Delayed) && self.run_at <= now
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Deserialize the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    pub(crate) fn mark_claimed(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Active;
        self.attempts += 1;
        self.updated_at = now;
    }

    pub(crate) fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Completed;
        self.updated_at = now;
        self.processed_at = Some(now);
    }

    /// Put the job back in line after a failed attempt.
    pub(crate) fn mark_retry(&mut self, error: &str, delay: Duration, now: DateTime<Utc>) {
        self.last_error = Some(error.to_string());
        self.updated_at = now;
        self.run_at = now + to_chrono(delay);
        self.state = if delay.is_zero() {
            JobState::Waiting
        } else {
            JobState::Delayed
        };
    }

    pub(crate) fn mark_failed(&mut self, error: &str, now: DateTime<Utc>) {
        self.last_error = Some(error.to_string());
        self.state = JobState::Failed;
        self.updated_at = now;
        self.processed_at = Some(now);
    }

    /// Operator requeue of a failed job: grants `extra_attempts` more tries on
    /// top of the attempts already made, so `attempts` stays monotonic.
    pub(crate) fn mark_requeued(&mut self, extra_attempts: u32, now: DateTime<Utc>) {
        self.state = JobState::Waiting;
        self.max_attempts = self.attempts + extra_attempts.max(1);
        self.run_at = now;
        self.updated_at = now;
        self.processed_at = None;
    }
}

pub(crate) fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Outcome of a failed handler invocation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    /// Transient failure; retried with the worker's backoff.
    #[error("{0}")]
    Failed(String),
    /// Retry after an explicit delay (still bounded by `max_attempts`).
    #[error("{message} (retry after {delay:?})")]
    RetryAfter { message: String, delay: Duration },
    /// Permanent failure; the job goes straight to `failed`.
    #[error("{0}")]
    Fatal(String),
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn retry_after(message: impl Into<String>, delay: Duration) -> Self {
        Self::RetryAfter {
            message: message.into(),
            delay,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            JobError::Failed(m) | JobError::Fatal(m) => m,
            JobError::RetryAfter { message, .. } => message,
        }
    }
}

/// A payload that does not decode will not decode on the next attempt either.
impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::Fatal(format!("invalid job payload: {err}"))
    }
}
