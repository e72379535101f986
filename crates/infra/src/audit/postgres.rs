//! Postgres-backed audit sink.
//!
//! Entries are keyed by job id (`ON CONFLICT (job_id) DO NOTHING`), which makes
//! recording idempotent under at-least-once delivery.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::instrument;

use fintrack_core::JobId;
use fintrack_events::AuditEvent;

use super::{AuditSink, AuditSinkError};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS audit_log (
    job_id      UUID PRIMARY KEY,
    action      TEXT NOT NULL,
    actor_id    TEXT NOT NULL,
    occurred_at TIMESTAMPTZ NOT NULL,
    context     JSONB NOT NULL DEFAULT '{}'::jsonb,
    recorded_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

const CREATE_ACTOR_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS audit_log_actor_idx ON audit_log (actor_id, occurred_at)";

#[derive(Debug, Clone)]
pub struct PostgresAuditLog {
    pool: PgPool,
}

impl PostgresAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `audit_log` table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), AuditSinkError> {
        for statement in [CREATE_TABLE, CREATE_ACTOR_INDEX] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl AuditSink for PostgresAuditLog {
    #[instrument(skip(self, event), fields(action = %event.action), err)]
    async fn record(&self, job_id: JobId, event: &AuditEvent) -> Result<bool, AuditSinkError> {
        let result = sqlx::query(
            r#"
            INSERT INTO audit_log (job_id, action, actor_id, occurred_at, context)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(event.action.as_str())
        .bind(&event.actor_id)
        .bind(event.occurred_at)
        .bind(&event.context)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("record", e))?;

        Ok(result.rows_affected() == 1)
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> AuditSinkError {
    match err {
        sqlx::Error::Database(db_err) => {
            AuditSinkError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            AuditSinkError::Storage(format!("connection pool closed in {operation}"))
        }
        other => AuditSinkError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
