//! Configuration error model.

use thiserror::Error;

/// Startup configuration failure.
///
/// These are fatal: a process that hits one logs it and exits non-zero rather
/// than running half-initialised.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A queue name was bound twice within the same process.
    #[error("queue already bound to a worker: {0}")]
    DuplicateQueue(String),

    /// A required setting was not provided.
    #[error("missing required setting: {0}")]
    MissingSetting(&'static str),

    /// A setting was provided but could not be used.
    #[error("invalid value for {key}: {reason}")]
    InvalidSetting { key: &'static str, reason: String },

    /// A worker was started without any queue to consume.
    #[error("worker must be bound to at least one queue")]
    NoQueues,

    /// A worker was started with zero concurrency.
    #[error("worker concurrency must be at least 1")]
    ZeroConcurrency,
}

impl ConfigError {
    pub fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            key,
            reason: reason.into(),
        }
    }
}
