//! Redis pub/sub broadcaster (optional).
//!
//! Redis pub/sub is not durable: a subscriber only sees messages published
//! while its connection is up. Publishes share one managed connection; every
//! subscription owns a dedicated pub/sub connection and re-subscribes with
//! capped backoff when it drops.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fintrack_core::ChannelName;
use fintrack_events::{BroadcastError, Broadcaster, PubSubMessage, Subscription};

const RECONNECT_MIN: Duration = Duration::from_millis(250);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Redis pub/sub broadcaster for JSON payloads.
#[derive(Clone)]
pub struct RedisBroadcaster {
    client: redis::Client,
    publisher: ConnectionManager,
}

impl std::fmt::Debug for RedisBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroadcaster").finish_non_exhaustive()
    }
}

impl RedisBroadcaster {
    pub fn new(client: redis::Client, publisher: ConnectionManager) -> Self {
        Self { client, publisher }
    }

    pub async fn connect(redis_url: &str) -> Result<Self, BroadcastError> {
        let (client, publisher) = crate::redis_conn::connect(redis_url)
            .await
            .map_err(|e| BroadcastError::Connection(e.to_string()))?;
        Ok(Self::new(client, publisher))
    }
}

#[async_trait]
impl Broadcaster for RedisBroadcaster {
    async fn publish(&self, channel: &ChannelName, payload: JsonValue) {
        let message = PubSubMessage::new(channel.clone(), payload);
        let body = match serde_json::to_string(&message) {
            Ok(body) => body,
            Err(e) => {
                warn!(channel = %channel, error = %e, "failed to encode pub/sub message; dropped");
                return;
            }
        };

        let mut conn = self.publisher.clone();
        match conn.publish::<_, _, i64>(channel.as_str(), body).await {
            Ok(receivers) => debug!(channel = %channel, receivers, "published"),
            Err(e) => warn!(channel = %channel, error = %e, "pub/sub publish failed; message dropped"),
        }
    }

    async fn subscribe(&self, channel: &ChannelName) -> Result<Subscription, BroadcastError> {
        // First connection is synchronous so the caller learns about a bad endpoint.
        let pubsub = open_subscription(&self.client, channel)
            .await
            .map_err(|e| BroadcastError::Connection(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(run_subscriber(
            self.client.clone(),
            channel.clone(),
            pubsub,
            tx,
            cancel.clone(),
        ));

        Ok(Subscription::new(channel.clone(), rx, cancel))
    }
}

async fn open_subscription(
    client: &redis::Client,
    channel: &ChannelName,
) -> redis::RedisResult<redis::aio::PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel.as_str()).await?;
    Ok(pubsub)
}

/// Decode a message body. Bodies that are not our envelope (other publishers)
/// are passed through as the payload.
fn decode(channel: &ChannelName, body: String) -> PubSubMessage {
    if let Ok(message) = serde_json::from_str::<PubSubMessage>(&body) {
        return message;
    }
    let payload = serde_json::from_str(&body).unwrap_or(JsonValue::String(body));
    PubSubMessage::new(channel.clone(), payload)
}

async fn run_subscriber(
    client: redis::Client,
    channel: ChannelName,
    initial: redis::aio::PubSub,
    tx: mpsc::UnboundedSender<PubSubMessage>,
    cancel: CancellationToken,
) {
    let mut connection = Some(initial);
    let mut backoff = RECONNECT_MIN;

    loop {
        let mut pubsub = match connection.take() {
            Some(pubsub) => pubsub,
            None => match open_subscription(&client, &channel).await {
                Ok(pubsub) => {
                    info!(channel = %channel, "pub/sub re-subscribed");
                    backoff = RECONNECT_MIN;
                    pubsub
                }
                Err(e) => {
                    error!(
                        channel = %channel,
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "pub/sub reconnect failed"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(RECONNECT_MAX);
                    continue;
                }
            },
        };

        let mut messages = pubsub.on_message();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                msg = messages.next() => match msg {
                    Some(msg) => {
                        let body: String = match msg.get_payload() {
                            Ok(body) => body,
                            Err(e) => {
                                warn!(channel = %channel, error = %e, "unreadable pub/sub payload");
                                continue;
                            }
                        };
                        if tx.send(decode(&channel, body)).is_err() {
                            return;
                        }
                    }
                    None => {
                        error!(channel = %channel, "pub/sub connection closed; messages until reconnect are lost");
                        break;
                    }
                },
            }
        }
    }
}
