//! Publish/subscribe abstraction for cross-process signals.
//!
//! The broadcaster is the **transport** for short-lived signals such as "this
//! access token was revoked" or "configuration changed". It deliberately makes
//! weak promises:
//!
//! - **Best effort**: `publish` never fails from the caller's point of view. A
//!   transport error is logged and the message is dropped; it is not retried.
//! - **No persistence**: subscribers only see messages published while they are
//!   connected. Gaps are expected and tolerated.
//! - **Per-channel order**: within one channel and one subscriber connection,
//!   messages arrive in publish order. Nothing is promised across channels.
//!
//! Anything that must not be lost belongs in the durable queue store, not here.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use fintrack_core::ChannelName;

use crate::message::PubSubMessage;

/// Subscription failures. Publishing has no error type on purpose.
#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("pub/sub connection error: {0}")]
    Connection(String),

    #[error("broadcaster is closed")]
    Closed,
}

/// A live subscription to one channel.
///
/// Messages are buffered per subscription, so a slow consumer never blocks the
/// publisher. Dropping the subscription (or calling [`Subscription::unsubscribe`])
/// ends it; unsubscribing more than once is a no-op.
#[derive(Debug)]
pub struct Subscription {
    channel: ChannelName,
    receiver: mpsc::UnboundedReceiver<PubSubMessage>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn new(
        channel: ChannelName,
        receiver: mpsc::UnboundedReceiver<PubSubMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            channel,
            receiver,
            cancel,
        }
    }

    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    /// Wait for the next message.
    ///
    /// Returns `None` once the subscription has been cancelled or the transport
    /// behind it has gone away for good.
    pub async fn recv(&mut self) -> Option<PubSubMessage> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            msg = self.receiver.recv() => msg,
        }
    }

    /// Take a buffered message without waiting.
    pub fn try_recv(&mut self) -> Option<PubSubMessage> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.receiver.try_recv().ok()
    }

    /// Stop receiving messages. Idempotent.
    pub fn unsubscribe(&mut self) {
        self.cancel.cancel();
        self.receiver.close();
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Token observed by the transport task feeding this subscription.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Stream for Subscription {
    type Item = PubSubMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Process-to-process publish/subscribe.
///
/// Implementations must be cheap to share (`Send + Sync`) and must never block a
/// publisher on a slow or absent subscriber.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Fire-and-forget publish. Failures are logged by the implementation.
    async fn publish(&self, channel: &ChannelName, payload: JsonValue);

    /// Open a subscription on `channel`.
    async fn subscribe(&self, channel: &ChannelName) -> Result<Subscription, BroadcastError>;
}

#[async_trait]
impl<B> Broadcaster for std::sync::Arc<B>
where
    B: Broadcaster + ?Sized,
{
    async fn publish(&self, channel: &ChannelName, payload: JsonValue) {
        (**self).publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &ChannelName) -> Result<Subscription, BroadcastError> {
        (**self).subscribe(channel).await
    }
}

/// Handle for a callback-driven subscription created by [`subscribe_with`].
#[derive(Debug)]
pub struct SubscriptionHandle {
    channel: ChannelName,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stop invoking the callback. Idempotent.
    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }

    /// Unsubscribe and wait for the callback task to finish.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "subscription task ended abnormally");
            }
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Subscribe to `channel` and invoke `on_message` once per received message for
/// as long as the returned handle is alive.
pub async fn subscribe_with<B, F>(
    bus: &B,
    channel: &ChannelName,
    mut on_message: F,
) -> Result<SubscriptionHandle, BroadcastError>
where
    B: Broadcaster + ?Sized,
    F: FnMut(PubSubMessage) + Send + 'static,
{
    let mut sub = bus.subscribe(channel).await?;
    let cancel = sub.cancel_token();

    let task = tokio::spawn(async move {
        while let Some(msg) = sub.recv().await {
            on_message(msg);
        }
    });

    Ok(SubscriptionHandle {
        channel: channel.clone(),
        cancel,
        task: Some(task),
    })
}
