//! Runtime configuration, read from environment variables.
//!
//! Every setting has a default except the connection URLs. Values that are
//! present but unusable are startup errors, never silently replaced.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use fintrack_core::{ChannelName, ConfigError, QueueName};
use fintrack_events::channels;

use crate::idempotency::GuardConfig;
use crate::jobs::{
    DEFAULT_COMPLETED_RETENTION, DEFAULT_MAX_ATTEMPTS, RetryPolicy, WorkerOptions, queues,
};

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Queue store and pub/sub endpoint.
    pub redis_url: Option<String>,
    /// Postgres for the audit sink and idempotency records.
    pub database_url: Option<String>,
    /// Use Redis/Postgres instead of in-memory stores (API process).
    pub use_persistent_stores: bool,
    pub bind_addr: SocketAddr,
    /// Queues served by the message worker.
    pub message_queues: Vec<QueueName>,
    pub audit_concurrency: usize,
    pub message_concurrency: usize,
    pub job_max_attempts: u32,
    pub job_lease: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub poll_interval: Duration,
    pub shutdown_timeout: Duration,
    /// How long completed jobs stay inspectable before the store drops them.
    pub completed_retention: Duration,
    pub idempotency_ttl: Duration,
    pub idempotency_wait: Duration,
    /// Channels relayed into the local event bridge.
    pub signal_channels: Vec<ChannelName>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            database_url: None,
            use_persistent_stores: false,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            message_queues: vec![QueueName::from_static(queues::MESSAGES)],
            audit_concurrency: 4,
            message_concurrency: 4,
            job_max_attempts: DEFAULT_MAX_ATTEMPTS,
            job_lease: Duration::from_secs(30),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(300),
            poll_interval: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(30),
            completed_retention: DEFAULT_COMPLETED_RETENTION,
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
            idempotency_wait: Duration::from_secs(10),
            signal_channels: channels::DEFAULT_RELAYED
                .iter()
                .map(|c| ChannelName::from_static(c))
                .collect(),
        }
    }
}

impl RuntimeConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let config = Self {
            redis_url: get("REDIS_URL"),
            database_url: get("DATABASE_URL"),
            use_persistent_stores: parse_or(
                "USE_PERSISTENT_STORES",
                get("USE_PERSISTENT_STORES"),
                defaults.use_persistent_stores,
            )?,
            bind_addr: parse_or("FINTRACK_BIND_ADDR", get("FINTRACK_BIND_ADDR"), defaults.bind_addr)?,
            message_queues: match get("FINTRACK_MESSAGE_QUEUES") {
                Some(raw) => parse_list("FINTRACK_MESSAGE_QUEUES", &raw, QueueName::new)?,
                None => defaults.message_queues,
            },
            audit_concurrency: positive(
                "FINTRACK_AUDIT_CONCURRENCY",
                get("FINTRACK_AUDIT_CONCURRENCY"),
                defaults.audit_concurrency,
            )?,
            message_concurrency: positive(
                "FINTRACK_MESSAGE_CONCURRENCY",
                get("FINTRACK_MESSAGE_CONCURRENCY"),
                defaults.message_concurrency,
            )?,
            job_max_attempts: positive(
                "FINTRACK_JOB_MAX_ATTEMPTS",
                get("FINTRACK_JOB_MAX_ATTEMPTS"),
                defaults.job_max_attempts,
            )?,
            job_lease: secs("FINTRACK_JOB_LEASE_SECS", get("FINTRACK_JOB_LEASE_SECS"), defaults.job_lease)?,
            backoff_base: millis(
                "FINTRACK_BACKOFF_BASE_MS",
                get("FINTRACK_BACKOFF_BASE_MS"),
                defaults.backoff_base,
            )?,
            backoff_max: secs(
                "FINTRACK_BACKOFF_MAX_SECS",
                get("FINTRACK_BACKOFF_MAX_SECS"),
                defaults.backoff_max,
            )?,
            poll_interval: millis(
                "FINTRACK_POLL_INTERVAL_MS",
                get("FINTRACK_POLL_INTERVAL_MS"),
                defaults.poll_interval,
            )?,
            shutdown_timeout: secs(
                "FINTRACK_SHUTDOWN_TIMEOUT_SECS",
                get("FINTRACK_SHUTDOWN_TIMEOUT_SECS"),
                defaults.shutdown_timeout,
            )?,
            completed_retention: secs(
                "FINTRACK_COMPLETED_RETENTION_SECS",
                get("FINTRACK_COMPLETED_RETENTION_SECS"),
                defaults.completed_retention,
            )?,
            idempotency_ttl: secs(
                "FINTRACK_IDEMPOTENCY_TTL_SECS",
                get("FINTRACK_IDEMPOTENCY_TTL_SECS"),
                defaults.idempotency_ttl,
            )?,
            idempotency_wait: secs(
                "FINTRACK_IDEMPOTENCY_WAIT_SECS",
                get("FINTRACK_IDEMPOTENCY_WAIT_SECS"),
                defaults.idempotency_wait,
            )?,
            signal_channels: match get("FINTRACK_SIGNAL_CHANNELS") {
                Some(raw) => parse_list("FINTRACK_SIGNAL_CHANNELS", &raw, ChannelName::new)?,
                None => defaults.signal_channels,
            },
        };

        if config.backoff_base > config.backoff_max {
            return Err(ConfigError::invalid(
                "FINTRACK_BACKOFF_BASE_MS",
                "must not exceed FINTRACK_BACKOFF_MAX_SECS",
            ));
        }
        if config.message_queues.iter().any(|q| q.as_str() == queues::AUDIT_LOG) {
            return Err(ConfigError::DuplicateQueue(queues::AUDIT_LOG.to_string()));
        }
        Ok(config)
    }

    pub fn require_redis_url(&self) -> Result<&str, ConfigError> {
        self.redis_url.as_deref().ok_or(ConfigError::MissingSetting("REDIS_URL"))
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::MissingSetting("DATABASE_URL"))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.job_max_attempts, self.backoff_base, self.backoff_max)
    }

    /// Defaults for pool workers; concurrency is set per worker.
    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions::default()
            .with_lease(self.job_lease)
            .with_poll_interval(self.poll_interval)
            .with_retry(self.retry_policy())
    }

    pub fn guard_config(&self) -> GuardConfig {
        GuardConfig::default()
            .with_ttl(self.idempotency_ttl)
            .with_wait_timeout(self.idempotency_wait)
    }
}

fn parse_or<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::invalid(key, e.to_string())),
        None => Ok(default),
    }
}

fn positive<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
    T::Err: std::fmt::Display,
{
    let value = parse_or(key, raw, default)?;
    if value == T::default() {
        return Err(ConfigError::invalid(key, "must be greater than zero"));
    }
    Ok(value)
}

fn secs(key: &'static str, raw: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    let default_secs = default.as_secs();
    positive(key, raw, default_secs).map(Duration::from_secs)
}

fn millis(key: &'static str, raw: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    let default_ms = default.as_millis() as u64;
    positive(key, raw, default_ms).map(Duration::from_millis)
}

fn parse_list<T, E>(
    key: &'static str,
    raw: &str,
    parse: impl Fn(String) -> Result<T, E>,
) -> Result<Vec<T>, ConfigError>
where
    E: std::fmt::Display,
{
    let items = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse(s.to_string()).map_err(|e| ConfigError::invalid(key, format!("`{s}`: {e}"))))
        .collect::<Result<Vec<_>, _>>()?;
    if items.is_empty() {
        return Err(ConfigError::invalid(key, "list must not be empty"));
    }
    Ok(items)
}

/// Strip credentials from a connection URL before logging it.
pub fn redacted(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}
