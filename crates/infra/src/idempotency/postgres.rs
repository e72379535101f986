//! Postgres-backed idempotency store.
//!
//! Expired rows are ignored by reads and overwritten by `begin`; call
//! [`PostgresIdempotencyStore::purge_expired`] periodically to reclaim space.
//! Every timestamp comparison uses the database clock (`now()`), so process
//! clock skew never decides whether a row is live.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::types::Uuid;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use fintrack_core::LeaseToken;

use super::record::{IdempotencyKey, IdempotencyRecord, IdempotencyStatus, RequestFingerprint};
use super::store::{BeginOutcome, IdempotencyStore, IdempotencyStoreError};

/// `begin` retries when a live row expires between its insert and its read;
/// more than this many races in a row is reported as a storage error.
const BEGIN_ATTEMPTS: usize = 5;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS idempotency_keys (
    key         TEXT PRIMARY KEY,
    fingerprint TEXT NOT NULL,
    status      TEXT NOT NULL,
    owner       UUID NOT NULL,
    response    JSONB,
    created_at  TIMESTAMPTZ NOT NULL,
    expires_at  TIMESTAMPTZ NOT NULL
)
"#;

const CREATE_EXPIRY_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idempotency_keys_expires_idx ON idempotency_keys (expires_at)";

#[derive(Debug, Clone)]
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), IdempotencyStoreError> {
        for statement in [CREATE_TABLE, CREATE_EXPIRY_INDEX] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    /// Delete expired rows; returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64, IdempotencyStoreError> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= now()")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_expired", e))?;
        Ok(result.rows_affected())
    }

    async fn fetch_live(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyStoreError> {
        let row = sqlx::query(
            r#"
            SELECT key, fingerprint, status, owner, response, created_at, expires_at
            FROM idempotency_keys
            WHERE key = $1 AND expires_at > now()
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| record_from_row(&row)).transpose()
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<IdempotencyRecord, IdempotencyStoreError> {
    let column = |e: sqlx::Error| IdempotencyStoreError::Serialization(e.to_string());

    let key: String = row.try_get("key").map_err(column)?;
    let status: String = row.try_get("status").map_err(column)?;
    let status = IdempotencyStatus::parse(&status).ok_or_else(|| {
        IdempotencyStoreError::Serialization(format!("unknown status `{status}`"))
    })?;
    let key = IdempotencyKey::parse(Some(&key))
        .map_err(|e| IdempotencyStoreError::Serialization(e.to_string()))?;

    Ok(IdempotencyRecord {
        key,
        fingerprint: RequestFingerprint::from_hex(
            row.try_get::<String, _>("fingerprint").map_err(column)?,
        ),
        status,
        owner: LeaseToken::from_uuid(row.try_get::<Uuid, _>("owner").map_err(column)?),
        response: row.try_get::<Option<JsonValue>, _>("response").map_err(column)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(column)?,
        expires_at: row.try_get::<DateTime<Utc>, _>("expires_at").map_err(column)?,
    })
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    #[instrument(skip(self, fingerprint), fields(key = %key), err)]
    async fn begin(
        &self,
        key: &IdempotencyKey,
        fingerprint: &RequestFingerprint,
        pending_ttl: Duration,
    ) -> Result<BeginOutcome, IdempotencyStoreError> {
        for attempt in 1..=BEGIN_ATTEMPTS {
            let owner = LeaseToken::new();
            // Inserts, or takes over an expired row; a live row leaves nothing returned.
            let started = sqlx::query(
                r#"
                INSERT INTO idempotency_keys
                    (key, fingerprint, status, owner, response, created_at, expires_at)
                VALUES ($1, $2, 'pending', $3, NULL, now(), now() + $4::float8 * interval '1 millisecond')
                ON CONFLICT (key) DO UPDATE
                    SET fingerprint = EXCLUDED.fingerprint,
                        status = 'pending',
                        owner = EXCLUDED.owner,
                        response = NULL,
                        created_at = EXCLUDED.created_at,
                        expires_at = EXCLUDED.expires_at
                    WHERE idempotency_keys.expires_at <= now()
                RETURNING key
                "#,
            )
            .bind(key.as_str())
            .bind(fingerprint.as_str())
            .bind(owner.as_uuid())
            .bind(ttl_millis(pending_ttl))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

            if started.is_some() {
                return Ok(BeginOutcome::Started(owner));
            }
            if let Some(record) = self.fetch_live(key).await? {
                return Ok(BeginOutcome::Existing(record));
            }
            debug!(key = %key, attempt, "idempotency row expired between insert and read");
        }
        Err(IdempotencyStoreError::Storage(format!(
            "begin for key `{key}` lost {BEGIN_ATTEMPTS} races against row expiry"
        )))
    }

    #[instrument(skip(self, owner, response), fields(key = %key), err)]
    async fn complete(
        &self,
        key: &IdempotencyKey,
        owner: &LeaseToken,
        response: JsonValue,
        ttl: Duration,
    ) -> Result<bool, IdempotencyStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET status = 'completed',
                response = $3,
                expires_at = now() + $4::float8 * interval '1 millisecond'
            WHERE key = $1 AND owner = $2 AND status = 'pending' AND expires_at > now()
            "#,
        )
        .bind(key.as_str())
        .bind(owner.as_uuid())
        .bind(&response)
        .bind(ttl_millis(ttl))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, owner), fields(key = %key), err)]
    async fn release(
        &self,
        key: &IdempotencyKey,
        owner: &LeaseToken,
    ) -> Result<(), IdempotencyStoreError> {
        sqlx::query(
            "DELETE FROM idempotency_keys WHERE key = $1 AND owner = $2 AND status = 'pending'",
        )
        .bind(key.as_str())
        .bind(owner.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("release", e))?;
        Ok(())
    }

    async fn get(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyStoreError> {
        self.fetch_live(key).await
    }
}

/// Milliseconds for an `interval` bind; saturates instead of wrapping.
fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> IdempotencyStoreError {
    match err {
        sqlx::Error::Database(db_err) => IdempotencyStoreError::Storage(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            IdempotencyStoreError::Connection(format!("{operation}: {err}"))
        }
        other => IdempotencyStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn interval_millis_saturate() {
        assert_eq!(ttl_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(ttl_millis(Duration::MAX), i64::MAX);
    }

    // The tests below run against the database at `DATABASE_URL` and are
    // skipped when it is not set.

    async fn live_store() -> Option<PostgresIdempotencyStore> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            eprintln!("DATABASE_URL not set; skipping Postgres idempotency test");
            return None;
        };
        let pool = PgPool::connect(&url).await.expect("DATABASE_URL is set but not reachable");
        let store = PostgresIdempotencyStore::new(pool);
        store.ensure_schema().await.unwrap();
        Some(store)
    }

    fn scratch_key() -> IdempotencyKey {
        IdempotencyKey::parse(Some(&format!("test-{}", LeaseToken::new()))).unwrap()
    }

    fn fp(body: &str) -> RequestFingerprint {
        RequestFingerprint::compute("POST", "/messages", body.as_bytes())
    }

    async fn started(
        store: &PostgresIdempotencyStore,
        key: &IdempotencyKey,
        ttl: Duration,
    ) -> LeaseToken {
        match store.begin(key, &fp("a"), ttl).await.unwrap() {
            BeginOutcome::Started(owner) => owner,
            other => panic!("expected a fresh claim, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn a_live_row_is_returned_to_later_callers() {
        let Some(store) = live_store().await else { return };
        let key = scratch_key();
        let owner = started(&store, &key, TTL).await;

        match store.begin(&key, &fp("b"), TTL).await.unwrap() {
            BeginOutcome::Existing(record) => {
                assert_eq!(record.owner, owner);
                assert_eq!(record.fingerprint, fp("a"));
                assert_eq!(record.status, IdempotencyStatus::Pending);
            }
            other => panic!("expected existing record, got {other:?}"),
        }

        assert!(store.complete(&key, &owner, json!({"id": 1}), TTL).await.unwrap());
        let record = store.get(&key).await.unwrap().unwrap();
        assert_eq!(record.status, IdempotencyStatus::Completed);
        assert_eq!(record.response, Some(json!({"id": 1})));
    }

    #[tokio::test]
    async fn an_expired_row_is_taken_over_by_a_new_owner() {
        let Some(store) = live_store().await else { return };
        let key = scratch_key();
        let stale = started(&store, &key, Duration::from_millis(20)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let current = started(&store, &key, TTL).await;

        store.release(&key, &stale).await.unwrap();
        assert!(!store.complete(&key, &stale, json!("stale"), TTL).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap().unwrap().owner, current);

        store.release(&key, &current).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
    }
}
