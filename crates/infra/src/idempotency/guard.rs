//! The idempotency guard: at most one execution per key.
//!
//! `execute` claims the key with an atomic `begin`. The owner runs the
//! operation and stores its result; duplicates of a completed key get the stored
//! result back, duplicates of a pending key wait for the owner (polling the
//! store with capped backoff) up to `wait_timeout`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, warn};

use fintrack_core::LeaseToken;

use super::record::{IdempotencyKey, IdempotencyRecord, IdempotencyStatus, KeyError, RequestFingerprint};
use super::store::{BeginOutcome, IdempotencyStore, IdempotencyStoreError};

#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Retention of completed records.
    pub ttl: Duration,
    /// Lifetime of a pending record; bounds how long a crashed request holds a key.
    pub pending_ttl: Duration,
    /// How long a duplicate waits on a pending key before giving up.
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            pending_ttl: Duration::from_secs(5 * 60),
            wait_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(25),
            max_poll_interval: Duration::from_millis(500),
        }
    }
}

impl GuardConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_pending_ttl(mut self, pending_ttl: Duration) -> Self {
        self.pending_ttl = pending_ttl;
        self
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }
}

/// How a guarded call produced its value.
#[derive(Debug, Clone, PartialEq)]
pub enum Execution<T> {
    /// The operation ran in this call.
    Fresh(T),
    /// A stored result was returned without running the operation.
    Replayed(T),
}

impl<T> Execution<T> {
    pub fn is_replayed(&self) -> bool {
        matches!(self, Execution::Replayed(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Execution::Fresh(value) | Execution::Replayed(value) => value,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError<E> {
    #[error("idempotency key is required")]
    MissingKey,
    #[error("invalid idempotency key: {0}")]
    InvalidKey(String),
    #[error("idempotency key `{key}` was used for a different request")]
    KeyConflict { key: IdempotencyKey },
    #[error("a request with idempotency key `{key}` is still in progress")]
    RequestInProgress { key: IdempotencyKey },
    #[error(transparent)]
    Store(#[from] IdempotencyStoreError),
    #[error("stored idempotent response is unreadable: {0}")]
    Serialization(String),
    #[error("operation failed: {0}")]
    Operation(E),
}

impl<E> From<KeyError> for IdempotencyError<E> {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::Missing => IdempotencyError::MissingKey,
            KeyError::Invalid(reason) => IdempotencyError::InvalidKey(reason),
        }
    }
}

/// Releases a pending key if the owning call is dropped before it resolves
/// (e.g. the client disconnected and the request future was cancelled).
struct PendingClaim {
    store: Arc<dyn IdempotencyStore>,
    key: IdempotencyKey,
    owner: LeaseToken,
    armed: bool,
}

impl PendingClaim {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingClaim {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        let key = self.key.clone();
        let owner = self.owner;
        runtime.spawn(async move {
            if let Err(e) = store.release(&key, &owner).await {
                warn!(key = %key, error = %e, "failed to release abandoned idempotency key");
            }
        });
    }
}

#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    config: GuardConfig,
}

impl std::fmt::Debug for IdempotencyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyGuard")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: GuardConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn IdempotencyStore> {
        &self.store
    }

    /// Run `operation` at most once for `key`.
    ///
    /// On success the result is stored and replayed to later calls with the
    /// same key and fingerprint. On failure the key is released, so the
    /// client may retry with it.
    pub async fn execute<T, E, F, Fut>(
        &self,
        key: &IdempotencyKey,
        fingerprint: &RequestFingerprint,
        operation: F,
    ) -> Result<Execution<T>, IdempotencyError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let deadline = Instant::now() + self.config.wait_timeout;
        let mut poll = self.config.poll_interval;

        loop {
            let existing = match self.store.begin(key, fingerprint, self.config.pending_ttl).await? {
                BeginOutcome::Started(owner) => return self.run_owned(key, owner, operation).await,
                BeginOutcome::Existing(record) => record,
            };

            let mut current = Some(existing);
            while let Some(record) = current.take() {
                if &record.fingerprint != fingerprint {
                    return Err(IdempotencyError::KeyConflict { key: key.clone() });
                }
                if record.status == IdempotencyStatus::Completed {
                    debug!(key = %key, "replaying stored result");
                    return replay(&record).map(Execution::Replayed);
                }

                if Instant::now() >= deadline {
                    return Err(IdempotencyError::RequestInProgress { key: key.clone() });
                }
                tokio::time::sleep(poll.min(deadline.saturating_duration_since(Instant::now()))).await;
                poll = (poll * 2).min(self.config.max_poll_interval);

                // None: the owner failed or its claim expired; compete for the key again.
                current = self.store.get(key).await?;
            }
        }
    }

    async fn run_owned<T, E, F, Fut>(
        &self,
        key: &IdempotencyKey,
        owner: LeaseToken,
        operation: F,
    ) -> Result<Execution<T>, IdempotencyError<E>>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut claim = PendingClaim {
            store: self.store.clone(),
            key: key.clone(),
            owner,
            armed: true,
        };

        let outcome = operation().await;
        claim.disarm();

        match outcome {
            Ok(value) => {
                let snapshot = match serde_json::to_value(&value) {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        self.release_quietly(key, &owner).await;
                        return Err(IdempotencyError::Serialization(e.to_string()));
                    }
                };
                match self.store.complete(key, &owner, snapshot, self.config.ttl).await {
                    Ok(true) => {}
                    Ok(false) => warn!(
                        key = %key,
                        "idempotency claim expired or was taken over before completion; result not stored"
                    ),
                    // The operation already took effect; report it rather than the store failure.
                    Err(e) => warn!(key = %key, error = %e, "failed to store idempotent result"),
                }
                Ok(Execution::Fresh(value))
            }
            Err(e) => {
                self.release_quietly(key, &owner).await;
                Err(IdempotencyError::Operation(e))
            }
        }
    }

    async fn release_quietly(&self, key: &IdempotencyKey, owner: &LeaseToken) {
        if let Err(e) = self.store.release(key, owner).await {
            // The pending record still expires after `pending_ttl`.
            warn!(key = %key, error = %e, "failed to release idempotency key");
        }
    }
}

fn replay<T: DeserializeOwned, E>(record: &IdempotencyRecord) -> Result<T, IdempotencyError<E>> {
    let snapshot = record
        .response
        .clone()
        .ok_or_else(|| IdempotencyError::Serialization("completed record has no response".into()))?;
    serde_json::from_value(snapshot).map_err(|e| IdempotencyError::Serialization(e.to_string()))
}
