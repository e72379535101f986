//! Idempotency record storage.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;

use fintrack_core::LeaseToken;

use super::record::{IdempotencyKey, IdempotencyRecord, RequestFingerprint};

/// Result of [`IdempotencyStore::begin`].
#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// A fresh `pending` record was created; the caller owns the key for as
    /// long as the record carries this token.
    Started(LeaseToken),
    /// A live record already exists for the key.
    Existing(IdempotencyRecord),
}

/// Idempotency store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IdempotencyStoreError {
    #[error("idempotency store connection error: {0}")]
    Connection(String),
    #[error("idempotency store error: {0}")]
    Storage(String),
    #[error("idempotency record serialization error: {0}")]
    Serialization(String),
}

/// Storage contract for idempotency records.
///
/// `begin` must check and create in one atomic step: of any number of
/// concurrent callers with the same key, exactly one sees `Started`.
/// Expired records are treated as absent. A `pending` record that expires
/// may be claimed again, so completion and release are keyed by the owner
/// token handed out by `begin`, never by the fingerprint.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn begin(
        &self,
        key: &IdempotencyKey,
        fingerprint: &RequestFingerprint,
        pending_ttl: Duration,
    ) -> Result<BeginOutcome, IdempotencyStoreError>;

    /// Store the response snapshot and mark the record `completed`, retained for
    /// `ttl`. Returns `false` if `owner` no longer holds a `pending` record for
    /// the key (it expired, was released or was claimed by someone else).
    async fn complete(
        &self,
        key: &IdempotencyKey,
        owner: &LeaseToken,
        response: JsonValue,
        ttl: Duration,
    ) -> Result<bool, IdempotencyStoreError>;

    /// Remove the `pending` record held by `owner`, freeing the key.
    async fn release(
        &self,
        key: &IdempotencyKey,
        owner: &LeaseToken,
    ) -> Result<(), IdempotencyStoreError>;

    async fn get(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyStoreError>;
}

/// In-memory idempotency store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    records: Mutex<HashMap<IdempotencyKey, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired records; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now));
        before - records.len()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn begin(
        &self,
        key: &IdempotencyKey,
        fingerprint: &RequestFingerprint,
        pending_ttl: Duration,
    ) -> Result<BeginOutcome, IdempotencyStoreError> {
        let mut records = self.records.lock();
        if let Some(existing) = records.get(key) {
            if !existing.is_expired(Utc::now()) {
                return Ok(BeginOutcome::Existing(existing.clone()));
            }
        }
        let record = IdempotencyRecord::pending(key.clone(), fingerprint.clone(), pending_ttl);
        let owner = record.owner;
        records.insert(key.clone(), record);
        Ok(BeginOutcome::Started(owner))
    }

    async fn complete(
        &self,
        key: &IdempotencyKey,
        owner: &LeaseToken,
        response: JsonValue,
        ttl: Duration,
    ) -> Result<bool, IdempotencyStoreError> {
        let mut records = self.records.lock();
        match records.get_mut(key) {
            Some(record) if record.is_owned_by(owner) && !record.is_expired(Utc::now()) => {
                record.complete(response, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(
        &self,
        key: &IdempotencyKey,
        owner: &LeaseToken,
    ) -> Result<(), IdempotencyStoreError> {
        let mut records = self.records.lock();
        if records.get(key).is_some_and(|r| r.is_owned_by(owner)) {
            records.remove(key);
        }
        Ok(())
    }

    async fn get(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyStoreError> {
        let records = self.records.lock();
        Ok(records
            .get(key)
            .filter(|r| !r.is_expired(Utc::now()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::idempotency::record::IdempotencyStatus;

    const TTL: Duration = Duration::from_secs(60);

    fn key(raw: &str) -> IdempotencyKey {
        IdempotencyKey::parse(Some(raw)).unwrap()
    }

    fn fp(body: &str) -> RequestFingerprint {
        RequestFingerprint::compute("POST", "/messages", body.as_bytes())
    }

    async fn start(store: &InMemoryIdempotencyStore, raw: &str, ttl: Duration) -> LeaseToken {
        match store.begin(&key(raw), &fp("a"), ttl).await.unwrap() {
            BeginOutcome::Started(owner) => owner,
            other => panic!("expected a fresh claim, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn only_the_first_begin_starts() {
        let store = InMemoryIdempotencyStore::new();

        let owner = start(&store, "k1", TTL).await;
        match store.begin(&key("k1"), &fp("a"), TTL).await.unwrap() {
            BeginOutcome::Existing(record) => {
                assert_eq!(record.status, IdempotencyStatus::Pending);
                assert_eq!(record.owner, owner);
            }
            other => panic!("expected existing record, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn completed_records_carry_the_snapshot() {
        let store = InMemoryIdempotencyStore::new();
        let owner = start(&store, "k1", TTL).await;

        assert!(store.complete(&key("k1"), &owner, json!({"ok": true}), TTL).await.unwrap());

        let record = store.get(&key("k1")).await.unwrap().unwrap();
        assert_eq!(record.status, IdempotencyStatus::Completed);
        assert_eq!(record.response, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn release_frees_only_pending_records_of_the_owner() {
        let store = InMemoryIdempotencyStore::new();
        let owner = start(&store, "k1", TTL).await;

        store.release(&key("k1"), &LeaseToken::new()).await.unwrap();
        assert!(store.get(&key("k1")).await.unwrap().is_some());

        store.release(&key("k1"), &owner).await.unwrap();
        assert!(store.get(&key("k1")).await.unwrap().is_none());

        let owner = start(&store, "k2", TTL).await;
        store.complete(&key("k2"), &owner, json!(1), TTL).await.unwrap();
        store.release(&key("k2"), &owner).await.unwrap();
        assert!(store.get(&key("k2")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn a_superseded_owner_cannot_touch_the_new_claim() {
        let store = InMemoryIdempotencyStore::new();
        let stale = start(&store, "k1", Duration::ZERO).await;
        // Same key and fingerprint, claimed again after the first claim expired.
        let current = start(&store, "k1", TTL).await;
        assert_ne!(stale, current);

        store.release(&key("k1"), &stale).await.unwrap();
        assert!(!store.complete(&key("k1"), &stale, json!("stale"), TTL).await.unwrap());
        let record = store.get(&key("k1")).await.unwrap().unwrap();
        assert_eq!(record.status, IdempotencyStatus::Pending);
        assert_eq!(record.owner, current);

        assert!(store.complete(&key("k1"), &current, json!("fresh"), TTL).await.unwrap());
        assert_eq!(
            store.get(&key("k1")).await.unwrap().unwrap().response,
            Some(json!("fresh"))
        );
    }

    #[tokio::test]
    async fn expired_records_are_absent() {
        let store = InMemoryIdempotencyStore::new();
        let owner = start(&store, "k1", Duration::ZERO).await;

        assert!(store.get(&key("k1")).await.unwrap().is_none());
        assert!(!store.complete(&key("k1"), &owner, json!(1), TTL).await.unwrap());
        assert!(matches!(
            store.begin(&key("k1"), &fp("b"), TTL).await.unwrap(),
            BeginOutcome::Started(_)
        ));

        start(&store, "k2", Duration::ZERO).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }
}
