//! Relay from pub/sub channels into the process's local event bridge.

use fintrack_core::ChannelName;
use fintrack_events::{
    BroadcastError, Broadcaster, LocalEventBridge, SubscriptionHandle, subscribe_with,
};
use tracing::{debug, info};

/// Forwards every message received on a set of channels into a
/// [`LocalEventBridge`], decoding well-known signals into their topics.
#[derive(Debug)]
pub struct BridgeRelay {
    handles: Vec<SubscriptionHandle>,
}

impl BridgeRelay {
    /// Subscribe to `channels` and start relaying.
    ///
    /// Fails if any subscription cannot be opened; subscriptions already made
    /// are dropped (and thereby cancelled).
    pub async fn start<B>(
        bus: &B,
        bridge: LocalEventBridge,
        channels: &[ChannelName],
    ) -> Result<Self, BroadcastError>
    where
        B: Broadcaster + ?Sized,
    {
        let mut handles = Vec::with_capacity(channels.len());
        for channel in channels {
            let bridge = bridge.clone();
            let handle = subscribe_with(bus, channel, move |message| {
                let channel = message.channel.clone();
                if bridge.emit_message(message).is_none() {
                    debug!(channel = %channel, "bridge closed; relayed message dropped");
                }
            })
            .await?;
            handles.push(handle);
        }

        info!(channels = ?channels, "relaying pub/sub channels into the local bridge");
        Ok(Self { handles })
    }

    pub fn channels(&self) -> impl Iterator<Item = &ChannelName> {
        self.handles.iter().map(SubscriptionHandle::channel)
    }

    /// Unsubscribe from every channel and wait for the relay tasks to finish.
    pub async fn stop(self) {
        for handle in self.handles {
            handle.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use fintrack_events::{EventKind, InMemoryBroadcaster, Signal, channels};

    use super::*;

    #[tokio::test]
    async fn relayed_signals_reach_local_observers() {
        let bus = InMemoryBroadcaster::new();
        let bridge = LocalEventBridge::new();
        let relay = BridgeRelay::start(
            &bus,
            bridge.clone(),
            &[
                ChannelName::from_static(channels::TOKEN_REVOKED),
                ChannelName::from_static(channels::CONFIG_CHANGED),
            ],
        )
        .await
        .unwrap();
        let mut observer = bridge.observe();

        let revoked = Signal::TokenRevoked {
            session_id: "s-1".into(),
            actor_id: None,
        };
        bus.publish(&revoked.channel(), revoked.to_payload()).await;

        let event = tokio::time::timeout(Duration::from_secs(1), observer.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.topic, "auth.token_revoked");
        assert_eq!(event.kind, EventKind::Notification);
        assert!(event.is_remote());

        let changed = Signal::ConfigChanged {
            key: "base_currency".into(),
            value: json!("EUR"),
        };
        bus.publish(&changed.channel(), changed.to_payload()).await;
        tokio::time::timeout(Duration::from_secs(1), observer.recv())
            .await
            .unwrap()
            .unwrap();

        // State-style signals are retained for late observers
        let latest = bridge.latest("config.base_currency").unwrap();
        assert_eq!(latest.payload["value"], "EUR");

        assert_eq!(relay.channels().count(), 2);
        relay.stop().await;
        assert_eq!(
            bus.subscriber_count(&ChannelName::from_static(channels::TOKEN_REVOKED)),
            0
        );
    }
}
