//! Redis-backed queue store (optional).
//!
//! Layout, per queue `q` under the `fintrack:queue:{q}` prefix:
//!
//! - `…:job:{id}`   HASH with the job fields
//! - `…:waiting`    ZSET of due jobs scored by `created_at` (ms); FIFO claim order
//! - `…:delayed`    ZSET scored by `run_at` (ms)
//! - `…:active`     ZSET scored by lease expiry (ms)
//! - `…:completed`  ZSET scored by completion time; entries and job hashes
//!   expire after the completed-job retention window
//! - `…:failed`     ZSET scored by failure time
//!
//! Claims and transitions run as Lua scripts so each is atomic. Scripts touch
//! job hashes derived from the prefix, so this layout targets a single Redis
//! endpoint, not a cluster.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::instrument;

use fintrack_core::{JobId, LeaseToken, QueueName};

use super::store::{
    ClaimedJob, DEFAULT_COMPLETED_RETENTION, LEASE_EXPIRED_ERROR, QueueStats, QueueStore,
    QueueStoreError,
};
use super::types::{Job, JobState, to_chrono};

const KEY_PREFIX: &str = "fintrack:queue";

const ENQUEUE_SCRIPT: &str = r#"
-- KEYS: job hash, target zset
-- ARGV: id, score, field/value pairs...
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV, 3))
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
return 1
"#;

const CLAIM_SCRIPT: &str = r#"
-- KEYS: waiting, delayed, active, failed
-- ARGV: now ms, lease ms, lease token, job key prefix, now rfc3339, lease-expired error
local now = tonumber(ARGV[1])

local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', now)
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[3], id)
  local key = ARGV[4] .. id
  local attempts = tonumber(redis.call('HGET', key, 'attempts') or '0')
  local max = tonumber(redis.call('HGET', key, 'max_attempts') or '1')
  redis.call('HDEL', key, 'lease')
  if attempts >= max then
    redis.call('HSET', key, 'state', 'failed', 'last_error', ARGV[6], 'updated_at', ARGV[5], 'processed_at', ARGV[5])
    redis.call('ZADD', KEYS[4], now, id)
  else
    local created = redis.call('HGET', key, 'created_ms')
    if created then
      redis.call('HSET', key, 'state', 'waiting', 'updated_at', ARGV[5])
      redis.call('ZADD', KEYS[1], created, id)
    end
  end
end

local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  local key = ARGV[4] .. id
  local created = redis.call('HGET', key, 'created_ms')
  if created then
    redis.call('HSET', key, 'state', 'waiting')
    redis.call('ZADD', KEYS[1], created, id)
  end
end

local head = redis.call('ZRANGE', KEYS[1], 0, 0)
if #head == 0 then
  return false
end
local id = head[1]
local key = ARGV[4] .. id
redis.call('ZREM', KEYS[1], id)
redis.call('ZADD', KEYS[3], now + tonumber(ARGV[2]), id)
redis.call('HINCRBY', key, 'attempts', 1)
redis.call('HSET', key, 'state', 'active', 'lease', ARGV[3], 'updated_at', ARGV[5])
return redis.call('HGETALL', key)
"#;

const TRANSITION_SCRIPT: &str = r#"
-- KEYS: job hash, active, target zset
-- ARGV: id, lease token, target state, score, retention ms (0 keeps the job),
--       prune cutoff score, field/value pairs...
if redis.call('HGET', KEYS[1], 'lease') ~= ARGV[2] then
  return false
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[1], 'lease')
redis.call('HSET', KEYS[1], 'state', ARGV[3], unpack(ARGV, 7))
redis.call('ZADD', KEYS[3], ARGV[4], ARGV[1])
if tonumber(ARGV[5]) > 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[5])
  redis.call('ZREMRANGEBYSCORE', KEYS[3], '-inf', ARGV[6])
end
return redis.call('HGETALL', KEYS[1])
"#;

const REQUEUE_SCRIPT: &str = r#"
-- KEYS: job hash, failed, waiting
-- ARGV: id, extra attempts, now rfc3339
if redis.call('HGET', KEYS[1], 'state') ~= 'failed' then
  return false
end
local attempts = tonumber(redis.call('HGET', KEYS[1], 'attempts'))
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[1], 'state', 'waiting', 'max_attempts', attempts + tonumber(ARGV[2]), 'run_at', ARGV[3], 'updated_at', ARGV[3])
redis.call('HDEL', KEYS[1], 'processed_at')
redis.call('ZADD', KEYS[3], redis.call('HGET', KEYS[1], 'created_ms'), ARGV[1])
return redis.call('HGETALL', KEYS[1])
"#;

/// Key names of one queue.
#[derive(Debug, Clone)]
struct QueueKeys {
    prefix: String,
}

impl QueueKeys {
    fn new(queue: &QueueName) -> Self {
        Self {
            prefix: format!("{KEY_PREFIX}:{queue}"),
        }
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    fn job(&self, id: JobId) -> String {
        format!("{}:job:{id}", self.prefix)
    }

    fn zset(&self, name: &str) -> String {
        format!("{}:{name}", self.prefix)
    }
}

/// Redis-backed queue store.
#[derive(Clone)]
pub struct RedisQueueStore {
    conn: ConnectionManager,
    completed_retention: Duration,
    enqueue: redis::Script,
    claim: redis::Script,
    transition: redis::Script,
    requeue: redis::Script,
}

impl std::fmt::Debug for RedisQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueueStore").finish_non_exhaustive()
    }
}

impl RedisQueueStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            completed_retention: DEFAULT_COMPLETED_RETENTION,
            enqueue: redis::Script::new(ENQUEUE_SCRIPT),
            claim: redis::Script::new(CLAIM_SCRIPT),
            transition: redis::Script::new(TRANSITION_SCRIPT),
            requeue: redis::Script::new(REQUEUE_SCRIPT),
        }
    }

    /// Connect to `redis_url` and build a store on a managed connection.
    pub async fn connect(redis_url: &str) -> Result<Self, QueueStoreError> {
        let (_, conn) = crate::redis_conn::connect(redis_url)
            .await
            .map_err(|e| QueueStoreError::Connection(e.to_string()))?;
        Ok(Self::new(conn))
    }

    pub fn with_completed_retention(mut self, retention: Duration) -> Self {
        self.completed_retention = retention;
        self
    }

    async fn run_transition(
        &self,
        claimed: &ClaimedJob,
        target_state: JobState,
        target_zset: &str,
        score: i64,
        fields: Vec<(&'static str, String)>,
    ) -> Result<Job, QueueStoreError> {
        // Completed jobs expire; retried and failed jobs are kept.
        let (retention_ms, prune_cutoff) = match target_state {
            JobState::Completed => {
                let retention = retention_millis(self.completed_retention);
                (retention, score - retention as i64)
            }
            _ => (0, 0),
        };
        let keys = QueueKeys::new(&claimed.job.queue);
        let mut invocation = self.transition.prepare_invoke();
        invocation
            .key(keys.job(claimed.job.id))
            .key(keys.zset("active"))
            .key(keys.zset(target_zset))
            .arg(claimed.job.id.to_string())
            .arg(claimed.lease.to_string())
            .arg(target_state.as_str())
            .arg(score)
            .arg(retention_ms)
            .arg(prune_cutoff);
        for (field, value) in fields {
            invocation.arg(field).arg(value);
        }

        let mut conn = self.conn.clone();
        let fields: Option<HashMap<String, String>> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        match fields {
            Some(fields) => job_from_fields(&fields),
            None => Err(QueueStoreError::LeaseLost(claimed.job.id)),
        }
    }
}

fn map_redis_error(err: redis::RedisError) -> QueueStoreError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        QueueStoreError::Connection(err.to_string())
    } else {
        QueueStoreError::Command(err.to_string())
    }
}

fn retention_millis(retention: Duration) -> u64 {
    // PEXPIRE 0 deletes at once and 0 means "keep" to the script; use 1ms.
    (retention.as_millis() as u64).max(1)
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>, QueueStoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| QueueStoreError::Serialization(format!("{field}: {e}")))
}

/// Hash fields for a new job. Optional fields are omitted when absent.
fn job_to_fields(job: &Job) -> Result<Vec<(&'static str, String)>, QueueStoreError> {
    let payload = serde_json::to_string(&job.payload)
        .map_err(|e| QueueStoreError::Serialization(e.to_string()))?;

    let mut fields = vec![
        ("id", job.id.to_string()),
        ("queue", job.queue.to_string()),
        ("payload", payload),
        ("state", job.state.as_str().to_string()),
        ("attempts", job.attempts.to_string()),
        ("max_attempts", job.max_attempts.to_string()),
        ("created_at", timestamp(job.created_at)),
        ("created_ms", job.created_at.timestamp_millis().to_string()),
        ("updated_at", timestamp(job.updated_at)),
        ("run_at", timestamp(job.run_at)),
    ];
    if let Some(kind) = &job.kind {
        fields.push(("kind", kind.clone()));
    }
    if let Some(error) = &job.last_error {
        fields.push(("last_error", error.clone()));
    }
    if let Some(at) = job.processed_at {
        fields.push(("processed_at", timestamp(at)));
    }
    Ok(fields)
}

fn job_from_fields(fields: &HashMap<String, String>) -> Result<Job, QueueStoreError> {
    let required = |name: &str| {
        fields
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| QueueStoreError::Serialization(format!("missing field `{name}`")))
    };
    let number = |name: &str| -> Result<u32, QueueStoreError> {
        required(name)?
            .parse()
            .map_err(|e| QueueStoreError::Serialization(format!("{name}: {e}")))
    };
    let invalid = |name: &str, e: &dyn std::fmt::Display| {
        QueueStoreError::Serialization(format!("{name}: {e}"))
    };

    let id: JobId = required("id")?.parse().map_err(|e| invalid("id", &e))?;
    let queue: QueueName = required("queue")?.parse().map_err(|e| invalid("queue", &e))?;
    let state = required("state")?;
    let state = JobState::parse(state).ok_or_else(|| invalid("state", &state))?;
    let payload = serde_json::from_str(required("payload")?).map_err(|e| invalid("payload", &e))?;

    Ok(Job {
        id,
        queue,
        kind: fields.get("kind").cloned(),
        payload,
        state,
        attempts: number("attempts")?,
        max_attempts: number("max_attempts")?,
        last_error: fields.get("last_error").cloned(),
        created_at: parse_timestamp("created_at", required("created_at")?)?,
        updated_at: parse_timestamp("updated_at", required("updated_at")?)?,
        run_at: parse_timestamp("run_at", required("run_at")?)?,
        processed_at: fields
            .get("processed_at")
            .map(|raw| parse_timestamp("processed_at", raw))
            .transpose()?,
    })
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn ping(&self) -> Result<(), QueueStoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, queue = %job.queue))]
    async fn enqueue(&self, job: Job) -> Result<JobId, QueueStoreError> {
        let keys = QueueKeys::new(&job.queue);
        let (target, score) = match job.state {
            JobState::Delayed => ("delayed", job.run_at.timestamp_millis()),
            _ => ("waiting", job.created_at.timestamp_millis()),
        };

        let mut invocation = self.enqueue.prepare_invoke();
        invocation
            .key(keys.job(job.id))
            .key(keys.zset(target))
            .arg(job.id.to_string())
            .arg(score);
        for (field, value) in job_to_fields(&job)? {
            invocation.arg(field).arg(value);
        }

        let mut conn = self.conn.clone();
        let created: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        if created == 0 {
            return Err(QueueStoreError::AlreadyExists(job.id));
        }
        Ok(job.id)
    }

    #[instrument(skip(self))]
    async fn claim(
        &self,
        queue: &QueueName,
        lease: Duration,
    ) -> Result<Option<ClaimedJob>, QueueStoreError> {
        let keys = QueueKeys::new(queue);
        let now = Utc::now();
        let token = LeaseToken::new();

        let mut conn = self.conn.clone();
        let fields: Option<HashMap<String, String>> = self
            .claim
            .key(keys.zset("waiting"))
            .key(keys.zset("delayed"))
            .key(keys.zset("active"))
            .key(keys.zset("failed"))
            .arg(now.timestamp_millis())
            .arg(lease.as_millis() as u64)
            .arg(token.to_string())
            .arg(keys.job_prefix())
            .arg(timestamp(now))
            .arg(LEASE_EXPIRED_ERROR)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let Some(fields) = fields else {
            return Ok(None);
        };
        Ok(Some(ClaimedJob {
            job: job_from_fields(&fields)?,
            lease: token,
            lease_expires_at: now + to_chrono(lease),
        }))
    }

    #[instrument(skip(self, claimed), fields(job_id = %claimed.job.id))]
    async fn complete(&self, claimed: &ClaimedJob) -> Result<Job, QueueStoreError> {
        let now = Utc::now();
        self.run_transition(
            claimed,
            JobState::Completed,
            "completed",
            now.timestamp_millis(),
            vec![("processed_at", timestamp(now)), ("updated_at", timestamp(now))],
        )
        .await
    }

    #[instrument(skip(self, claimed, error), fields(job_id = %claimed.job.id))]
    async fn retry(
        &self,
        claimed: &ClaimedJob,
        error: &str,
        delay: Duration,
    ) -> Result<Job, QueueStoreError> {
        let now = Utc::now();
        let run_at = now + to_chrono(delay);
        let (state, zset, score) = if delay.is_zero() {
            (JobState::Waiting, "waiting", claimed.job.created_at.timestamp_millis())
        } else {
            (JobState::Delayed, "delayed", run_at.timestamp_millis())
        };
        self.run_transition(
            claimed,
            state,
            zset,
            score,
            vec![
                ("last_error", error.to_string()),
                ("run_at", timestamp(run_at)),
                ("updated_at", timestamp(now)),
            ],
        )
        .await
    }

    #[instrument(skip(self, claimed, error), fields(job_id = %claimed.job.id))]
    async fn fail(&self, claimed: &ClaimedJob, error: &str) -> Result<Job, QueueStoreError> {
        let now = Utc::now();
        self.run_transition(
            claimed,
            JobState::Failed,
            "failed",
            now.timestamp_millis(),
            vec![
                ("last_error", error.to_string()),
                ("processed_at", timestamp(now)),
                ("updated_at", timestamp(now)),
            ],
        )
        .await
    }

    async fn get(&self, queue: &QueueName, id: JobId) -> Result<Option<Job>, QueueStoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(QueueKeys::new(queue).job(id))
            .await
            .map_err(map_redis_error)?;
        if fields.is_empty() {
            return Ok(None);
        }
        job_from_fields(&fields).map(Some)
    }

    async fn list_failed(
        &self,
        queue: &QueueName,
        limit: usize,
    ) -> Result<Vec<Job>, QueueStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrange(keys.zset("failed"), 0, limit as isize - 1)
            .await
            .map_err(map_redis_error)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hgetall(format!("{}{id}", keys.job_prefix()));
        }
        let rows: Vec<HashMap<String, String>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        rows.iter()
            .filter(|fields| !fields.is_empty())
            .map(job_from_fields)
            .collect()
    }

    #[instrument(skip(self))]
    async fn requeue_failed(
        &self,
        queue: &QueueName,
        id: JobId,
        extra_attempts: u32,
    ) -> Result<Job, QueueStoreError> {
        let current = self.get(queue, id).await?.ok_or(QueueStoreError::NotFound(id))?;
        if current.state != JobState::Failed {
            return Err(QueueStoreError::InvalidState {
                id,
                state: current.state,
                expected: JobState::Failed,
            });
        }

        let keys = QueueKeys::new(queue);
        let mut conn = self.conn.clone();
        let fields: Option<HashMap<String, String>> = self
            .requeue
            .key(keys.job(id))
            .key(keys.zset("failed"))
            .key(keys.zset("waiting"))
            .arg(id.to_string())
            .arg(extra_attempts.max(1))
            .arg(timestamp(Utc::now()))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        match fields {
            Some(fields) => job_from_fields(&fields),
            // Requeued concurrently by someone else
            None => Err(QueueStoreError::InvalidState {
                id,
                state: JobState::Waiting,
                expected: JobState::Failed,
            }),
        }
    }

    async fn stats(&self, queue: &QueueName) -> Result<QueueStats, QueueStoreError> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn.clone();
        let (waiting, delayed, active, completed, failed): (usize, usize, usize, usize, usize) =
            redis::pipe()
                .zcard(keys.zset("waiting"))
                .zcard(keys.zset("delayed"))
                .zcard(keys.zset("active"))
                .zcard(keys.zset("completed"))
                .zcard(keys.zset("failed"))
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;

        Ok(QueueStats {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn as_map(fields: Vec<(&'static str, String)>) -> HashMap<String, String> {
        fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn keys_are_namespaced_per_queue() {
        let keys = QueueKeys::new(&QueueName::from_static("audit-log"));
        assert_eq!(keys.zset("waiting"), "fintrack:queue:audit-log:waiting");

        let id = JobId::new();
        assert_eq!(keys.job(id), format!("{}{id}", keys.job_prefix()));
    }

    #[test]
    fn hash_fields_restore_the_job() {
        let job = Job::new(QueueName::from_static("messages"), json!({"to": ["a", "b"]}))
            .with_kind("notification.email")
            .with_max_attempts(3);

        let restored = job_from_fields(&as_map(job_to_fields(&job).unwrap())).unwrap();
        assert_eq!(restored.id, job.id);
        assert_eq!(restored.kind, job.kind);
        assert_eq!(restored.payload, job.payload);
        assert_eq!(restored.max_attempts, 3);
        assert_eq!(restored.state, JobState::Waiting);
        assert!(restored.last_error.is_none());
        assert!(restored.processed_at.is_none());
    }

    #[test]
    fn missing_or_corrupt_fields_are_serialization_errors() {
        let job = Job::new(QueueName::from_static("messages"), json!({}));
        let mut fields = as_map(job_to_fields(&job).unwrap());
        fields.insert("state".into(), "exploded".into());
        assert!(matches!(
            job_from_fields(&fields),
            Err(QueueStoreError::Serialization(_))
        ));

        fields.remove("state");
        assert!(matches!(
            job_from_fields(&fields),
            Err(QueueStoreError::Serialization(_))
        ));
    }

    // The tests below run the scripts against the Redis at `REDIS_URL` and are
    // skipped when it is not set.

    const LEASE: Duration = Duration::from_secs(30);

    async fn live_store() -> Option<RedisQueueStore> {
        let Ok(url) = std::env::var("REDIS_URL") else {
            eprintln!("REDIS_URL not set; skipping Redis queue test");
            return None;
        };
        Some(
            RedisQueueStore::connect(&url)
                .await
                .expect("REDIS_URL is set but not reachable"),
        )
    }

    fn scratch_queue() -> QueueName {
        QueueName::new(format!("test-{}", JobId::new())).unwrap()
    }

    async fn drop_queue(store: &RedisQueueStore, queue: &QueueName) {
        let mut conn = store.conn.clone();
        let keys: Vec<String> = conn
            .keys(format!("{}:*", QueueKeys::new(queue).prefix))
            .await
            .unwrap();
        if !keys.is_empty() {
            let _: i64 = conn.del(keys).await.unwrap();
        }
    }

    #[tokio::test]
    async fn concurrent_claims_hand_out_a_job_once() {
        let Some(store) = live_store().await else { return };
        let queue = scratch_queue();
        let id = store.enqueue(Job::new(queue.clone(), json!({}))).await.unwrap();

        let (a, b) = tokio::join!(store.claim(&queue, LEASE), store.claim(&queue, LEASE));
        let claimed: Vec<ClaimedJob> = [a.unwrap(), b.unwrap()].into_iter().flatten().collect();

        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].job.id, id);
        assert_eq!(claimed[0].job.state, JobState::Active);
        assert_eq!(claimed[0].job.attempts, 1);
        drop_queue(&store, &queue).await;
    }

    #[tokio::test]
    async fn claims_follow_enqueue_order() {
        let Some(store) = live_store().await else { return };
        let queue = scratch_queue();
        let mut ids = Vec::new();
        for n in 0..3 {
            ids.push(store.enqueue(Job::new(queue.clone(), json!({ "n": n }))).await.unwrap());
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        for expected in ids {
            let claimed = store.claim(&queue, LEASE).await.unwrap().unwrap();
            assert_eq!(claimed.job.id, expected);
        }
        drop_queue(&store, &queue).await;
    }

    #[tokio::test]
    async fn a_stale_lease_cannot_resolve_the_job() {
        let Some(store) = live_store().await else { return };
        let queue = scratch_queue();
        store.enqueue(Job::new(queue.clone(), json!({}))).await.unwrap();

        let first = store.claim(&queue, Duration::ZERO).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = store.claim(&queue, LEASE).await.unwrap().unwrap();
        assert_eq!(second.job.id, first.job.id);
        assert_eq!(second.job.attempts, 2);

        assert!(matches!(
            store.complete(&first).await,
            Err(QueueStoreError::LeaseLost(_))
        ));
        let done = store.complete(&second).await.unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert!(done.processed_at.is_some());
        drop_queue(&store, &queue).await;
    }

    #[tokio::test]
    async fn delayed_jobs_become_claimable_when_due() {
        let Some(store) = live_store().await else { return };
        let queue = scratch_queue();
        let id = store
            .enqueue(Job::new(queue.clone(), json!({})).delayed(Duration::from_millis(50)))
            .await
            .unwrap();

        assert!(store.claim(&queue, LEASE).await.unwrap().is_none());
        assert_eq!(store.stats(&queue).await.unwrap().delayed, 1);

        tokio::time::sleep(Duration::from_millis(80)).await;

        let claimed = store.claim(&queue, LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.job.id, id);
        assert_eq!(store.stats(&queue).await.unwrap().delayed, 0);
        drop_queue(&store, &queue).await;
    }

    #[tokio::test]
    async fn failed_jobs_can_be_requeued() {
        let Some(store) = live_store().await else { return };
        let queue = scratch_queue();
        let id = store
            .enqueue(Job::new(queue.clone(), json!({})).with_max_attempts(1))
            .await
            .unwrap();
        let claimed = store.claim(&queue, LEASE).await.unwrap().unwrap();
        store.fail(&claimed, "handler exploded").await.unwrap();

        let failed = store.list_failed(&queue, 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("handler exploded"));

        let requeued = store.requeue_failed(&queue, id, 2).await.unwrap();
        assert_eq!(requeued.state, JobState::Waiting);
        assert_eq!(requeued.max_attempts, 3);
        assert!(matches!(
            store.requeue_failed(&queue, id, 1).await,
            Err(QueueStoreError::InvalidState { .. })
        ));

        let reclaimed = store.claim(&queue, LEASE).await.unwrap().unwrap();
        assert_eq!(reclaimed.job.attempts, 2);
        assert!(store.list_failed(&queue, 10).await.unwrap().is_empty());
        drop_queue(&store, &queue).await;
    }

    #[tokio::test]
    async fn completed_jobs_expire_after_the_retention_window() {
        let Some(store) = live_store().await else { return };
        let store = store.with_completed_retention(Duration::from_millis(50));
        let queue = scratch_queue();

        let first = store.enqueue(Job::new(queue.clone(), json!({}))).await.unwrap();
        let claimed = store.claim(&queue, LEASE).await.unwrap().unwrap();
        store.complete(&claimed).await.unwrap();
        assert!(store.get(&queue, first).await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.get(&queue, first).await.unwrap().is_none());

        store.enqueue(Job::new(queue.clone(), json!({}))).await.unwrap();
        let claimed = store.claim(&queue, LEASE).await.unwrap().unwrap();
        store.complete(&claimed).await.unwrap();
        assert_eq!(store.stats(&queue).await.unwrap().completed, 1);
        drop_queue(&store, &queue).await;
    }
}
