//! Redis-backed idempotency store (optional).
//!
//! Each key maps to one string value, `fintrack:idempotency:{key}`, holding
//! the JSON record and expiring with it (`PX`). Scripts keep check-and-set
//! atomic; completion swaps the record only if it is still exactly the pending
//! record the owner read.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde_json::Value as JsonValue;
use tracing::instrument;

use fintrack_core::LeaseToken;

use super::record::{IdempotencyKey, IdempotencyRecord, RequestFingerprint};
use super::store::{BeginOutcome, IdempotencyStore, IdempotencyStoreError};

const KEY_PREFIX: &str = "fintrack:idempotency";

const BEGIN_SCRIPT: &str = r#"
-- KEYS: record key
-- ARGV: pending record json, ttl ms
local existing = redis.call('GET', KEYS[1])
if existing then
  return existing
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
return false
"#;

const COMPLETE_SCRIPT: &str = r#"
-- KEYS: record key
-- ARGV: pending record json as read, completed record json, ttl ms
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
return 1
"#;

const RELEASE_SCRIPT: &str = r#"
-- KEYS: record key
-- ARGV: owner token
local existing = redis.call('GET', KEYS[1])
if not existing then
  return 0
end
local record = cjson.decode(existing)
if record['status'] ~= 'pending' or record['owner'] ~= ARGV[1] then
  return 0
end
return redis.call('DEL', KEYS[1])
"#;

#[derive(Clone)]
pub struct RedisIdempotencyStore {
    conn: ConnectionManager,
    begin: redis::Script,
    complete: redis::Script,
    release: redis::Script,
}

impl std::fmt::Debug for RedisIdempotencyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisIdempotencyStore").finish_non_exhaustive()
    }
}

impl RedisIdempotencyStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            begin: redis::Script::new(BEGIN_SCRIPT),
            complete: redis::Script::new(COMPLETE_SCRIPT),
            release: redis::Script::new(RELEASE_SCRIPT),
        }
    }

    pub async fn connect(redis_url: &str) -> Result<Self, IdempotencyStoreError> {
        let (_, conn) = crate::redis_conn::connect(redis_url)
            .await
            .map_err(map_redis_error)?;
        Ok(Self::new(conn))
    }
}

fn record_key(key: &IdempotencyKey) -> String {
    format!("{KEY_PREFIX}:{key}")
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PX rejects 0
    (ttl.as_millis() as u64).max(1)
}

fn map_redis_error(err: redis::RedisError) -> IdempotencyStoreError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        IdempotencyStoreError::Connection(err.to_string())
    } else {
        IdempotencyStoreError::Storage(err.to_string())
    }
}

fn encode(record: &IdempotencyRecord) -> Result<String, IdempotencyStoreError> {
    serde_json::to_string(record).map_err(|e| IdempotencyStoreError::Serialization(e.to_string()))
}

fn decode(raw: &str) -> Result<IdempotencyRecord, IdempotencyStoreError> {
    serde_json::from_str(raw).map_err(|e| IdempotencyStoreError::Serialization(e.to_string()))
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    #[instrument(skip(self, fingerprint), fields(key = %key))]
    async fn begin(
        &self,
        key: &IdempotencyKey,
        fingerprint: &RequestFingerprint,
        pending_ttl: Duration,
    ) -> Result<BeginOutcome, IdempotencyStoreError> {
        let pending = IdempotencyRecord::pending(key.clone(), fingerprint.clone(), pending_ttl);
        let mut conn = self.conn.clone();
        let existing: Option<String> = self
            .begin
            .key(record_key(key))
            .arg(encode(&pending)?)
            .arg(ttl_millis(pending_ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        match existing {
            Some(raw) => Ok(BeginOutcome::Existing(decode(&raw)?)),
            None => Ok(BeginOutcome::Started(pending.owner)),
        }
    }

    #[instrument(skip(self, owner, response), fields(key = %key))]
    async fn complete(
        &self,
        key: &IdempotencyKey,
        owner: &LeaseToken,
        response: JsonValue,
        ttl: Duration,
    ) -> Result<bool, IdempotencyStoreError> {
        let mut conn = self.conn.clone();
        let Some(raw) = conn
            .get::<_, Option<String>>(record_key(key))
            .await
            .map_err(map_redis_error)?
        else {
            return Ok(false);
        };
        let mut record = decode(&raw)?;
        if !record.is_owned_by(owner) {
            return Ok(false);
        }
        record.complete(response, ttl);

        let stored: i64 = self
            .complete
            .key(record_key(key))
            .arg(raw)
            .arg(encode(&record)?)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(stored == 1)
    }

    #[instrument(skip(self, owner), fields(key = %key))]
    async fn release(
        &self,
        key: &IdempotencyKey,
        owner: &LeaseToken,
    ) -> Result<(), IdempotencyStoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .release
            .key(record_key(key))
            .arg(owner.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn get(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyStoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(record_key(key)).await.map_err(map_redis_error)?;
        raw.as_deref().map(decode).transpose()
    }
}
