//! In-memory broadcaster for tests/dev.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use fintrack_core::ChannelName;

use crate::bus::{BroadcastError, Broadcaster, Subscription};
use crate::message::PubSubMessage;

/// In-memory pub/sub broadcaster.
///
/// - Single process only
/// - Best-effort fan-out, no persistence
/// - Per-channel ordering (one unbounded queue per subscriber)
#[derive(Debug, Default)]
pub struct InMemoryBroadcaster {
    channels: Mutex<HashMap<ChannelName, Vec<mpsc::UnboundedSender<PubSubMessage>>>>,
}

impl InMemoryBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers on `channel`.
    pub fn subscriber_count(&self, channel: &ChannelName) -> usize {
        let mut channels = self.channels.lock();
        match channels.get_mut(channel) {
            Some(subs) => {
                subs.retain(|tx| !tx.is_closed());
                subs.len()
            }
            None => 0,
        }
    }
}

#[async_trait]
impl Broadcaster for InMemoryBroadcaster {
    async fn publish(&self, channel: &ChannelName, payload: JsonValue) {
        let message = PubSubMessage::new(channel.clone(), payload);
        let mut channels = self.channels.lock();

        let Some(subs) = channels.get_mut(channel) else {
            trace!(channel = %channel, "publish with no subscribers");
            return;
        };

        // Drop any dead subscribers while publishing.
        subs.retain(|tx| tx.send(message.clone()).is_ok());
        if subs.is_empty() {
            channels.remove(channel);
        }
    }

    async fn subscribe(&self, channel: &ChannelName) -> Result<Subscription, BroadcastError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.lock().entry(channel.clone()).or_default().push(tx);
        Ok(Subscription::new(channel.clone(), rx, CancellationToken::new()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::bus::subscribe_with;

    fn channel(name: &'static str) -> ChannelName {
        ChannelName::from_static(name)
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_no_op() {
        let bus = InMemoryBroadcaster::new();
        let ch = channel("fintrack:empty");

        tokio::time::timeout(Duration::from_millis(100), bus.publish(&ch, json!({"n": 1})))
            .await
            .expect("publish must not block");

        assert_eq!(bus.subscriber_count(&ch), 0);
    }

    #[tokio::test]
    async fn every_subscriber_receives_messages_in_order() {
        let bus = InMemoryBroadcaster::new();
        let ch = channel("fintrack:ordered");
        let mut a = bus.subscribe(&ch).await.unwrap();
        let mut b = bus.subscribe(&ch).await.unwrap();

        for n in 0..5 {
            bus.publish(&ch, json!({ "n": n })).await;
        }

        for sub in [&mut a, &mut b] {
            for n in 0..5 {
                let msg = sub.recv().await.unwrap();
                assert_eq!(msg.payload, json!({ "n": n }));
                assert_eq!(msg.channel, ch);
            }
        }
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let bus = InMemoryBroadcaster::new();
        let mut revoked = bus.subscribe(&channel("fintrack:revoked")).await.unwrap();

        bus.publish(&channel("fintrack:config"), json!("ignored")).await;
        bus.publish(&channel("fintrack:revoked"), json!("seen")).await;

        assert_eq!(revoked.recv().await.unwrap().payload, json!("seen"));
        assert!(revoked.try_recv().is_none());
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_stops_delivery() {
        let bus = InMemoryBroadcaster::new();
        let ch = channel("fintrack:unsub");
        let mut sub = bus.subscribe(&ch).await.unwrap();

        sub.unsubscribe();
        sub.unsubscribe();

        bus.publish(&ch, json!(1)).await;
        assert!(!sub.is_active());
        assert!(sub.recv().await.is_none());
        assert_eq!(bus.subscriber_count(&ch), 0);
    }

    #[tokio::test]
    async fn callback_subscription_runs_until_unsubscribed() {
        let bus = Arc::new(InMemoryBroadcaster::new());
        let ch = channel("fintrack:callback");
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        let handle = subscribe_with(&*bus, &ch, move |msg| {
            let _ = seen_tx.send(msg.payload);
        })
        .await
        .unwrap();

        bus.publish(&ch, json!("first")).await;
        assert_eq!(seen_rx.recv().await.unwrap(), json!("first"));

        handle.unsubscribe();
        handle.unsubscribe();
        handle.close().await;

        bus.publish(&ch, json!("second")).await;
        assert!(seen_rx.recv().await.is_none());
    }
}
