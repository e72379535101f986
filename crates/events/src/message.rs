use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use fintrack_core::ChannelName;

/// A message travelling over a pub/sub channel.
///
/// Messages are transient: nobody owns or persists them, and a message that no
/// connected subscriber receives is simply gone. Keep durable state (job outcomes,
/// balances) out of `payload`; treat it as a hint that something changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PubSubMessage {
    pub channel: ChannelName,
    pub payload: JsonValue,
    pub published_at: DateTime<Utc>,
}

impl PubSubMessage {
    pub fn new(channel: ChannelName, payload: JsonValue) -> Self {
        Self {
            channel,
            payload,
            published_at: Utc::now(),
        }
    }
}
