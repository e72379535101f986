//! Redis connection wiring shared by the queue store, broadcaster and
//! idempotency store.

use redis::aio::ConnectionManager;
use tracing::info;

use crate::config::redacted;

/// Open a client for `redis_url` and a managed (auto-reconnecting) connection.
///
/// The client is kept for dedicated pub/sub connections, which cannot be
/// multiplexed.
pub async fn connect(redis_url: &str) -> Result<(redis::Client, ConnectionManager), redis::RedisError> {
    let client = redis::Client::open(redis_url)?;
    let manager = ConnectionManager::new(client.clone()).await?;
    info!(endpoint = %redacted(redis_url), "connected to redis");
    Ok((client, manager))
}
