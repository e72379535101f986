//! Local event bridge: one in-process multicast stream for remote signals and
//! local state changes.
//!
//! Components inside a process (session cache, config holder, SSE endpoint, ...)
//! observe the bridge instead of each opening their own pub/sub subscription.
//!
//! ## Delivery
//!
//! - **Multicast**: every observer sees every event matching its filter.
//! - **Non-blocking emit**: fan-out goes through a bounded broadcast buffer. An
//!   observer that falls behind loses the oldest events; the emitter never waits.
//! - **State replay**: for [`EventKind::State`] events the latest value per topic
//!   is retained and handed to new observers first. Notifications are not retained.
//!   At most `max_retained` topics are kept; a new topic beyond that evicts the
//!   topic whose latest event is oldest.
//!
//! The bridge is owned by whoever builds the process services; it is created at
//! startup, cloned into the components that need it and closed on shutdown.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use fintrack_core::ChannelName;

use crate::message::PubSubMessage;
use crate::signal::Signal;

const DEFAULT_CAPACITY: usize = 256;
const DEFAULT_MAX_RETAINED: usize = 1024;

/// Whether an event describes current state (retained) or something that happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    State,
    Notification,
}

/// Where an event entered the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum EventOrigin {
    Local,
    Remote { channel: ChannelName },
}

/// An event flowing through the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEvent {
    /// Position in this bridge's emission order (assigned by `emit`).
    pub seq: u64,
    pub topic: String,
    pub kind: EventKind,
    pub payload: JsonValue,
    pub origin: EventOrigin,
    pub emitted_at: DateTime<Utc>,
}

impl LocalEvent {
    fn build(topic: impl Into<String>, kind: EventKind, payload: JsonValue) -> Self {
        Self {
            seq: 0,
            topic: topic.into(),
            kind,
            payload,
            origin: EventOrigin::Local,
            emitted_at: Utc::now(),
        }
    }

    /// A state-style event; the latest one per topic is replayed to new observers.
    pub fn state(topic: impl Into<String>, payload: JsonValue) -> Self {
        Self::build(topic, EventKind::State, payload)
    }

    /// A transient notification; never replayed.
    pub fn notification(topic: impl Into<String>, payload: JsonValue) -> Self {
        Self::build(topic, EventKind::Notification, payload)
    }

    /// Wrap a message received from pub/sub.
    ///
    /// Well-known [`Signal`] payloads keep their own topic and kind; anything else
    /// becomes a notification whose topic is the channel name.
    pub fn from_message(message: PubSubMessage) -> Self {
        let mut event = match Signal::from_payload(&message.payload) {
            Some(signal) => signal.to_local_event(),
            None => Self::notification(message.channel.as_str(), message.payload),
        };
        event.origin = EventOrigin::Remote {
            channel: message.channel,
        };
        event
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.origin, EventOrigin::Remote { .. })
    }
}

/// Observer-side filter.
pub type EventFilter = Arc<dyn Fn(&LocalEvent) -> bool + Send + Sync>;

struct BridgeState {
    next_seq: u64,
    retained: HashMap<String, LocalEvent>,
    max_retained: usize,
    sender: Option<broadcast::Sender<LocalEvent>>,
}

impl BridgeState {
    fn retain(&mut self, event: LocalEvent) {
        if !self.retained.contains_key(&event.topic) && self.retained.len() >= self.max_retained {
            let oldest = self
                .retained
                .values()
                .min_by_key(|retained| retained.seq)
                .map(|retained| retained.topic.clone());
            if let Some(topic) = oldest {
                debug!(topic = %topic, "retained topic limit reached; evicting oldest state");
                self.retained.remove(&topic);
            }
        }
        self.retained.insert(event.topic.clone(), event);
    }
}

/// Per-process multicast bridge. Cheap to clone; clones share one bridge.
#[derive(Clone)]
pub struct LocalEventBridge {
    state: Arc<Mutex<BridgeState>>,
}

impl std::fmt::Debug for LocalEventBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LocalEventBridge")
            .field("next_seq", &state.next_seq)
            .field("retained", &state.retained.len())
            .field("closed", &state.sender.is_none())
            .finish()
    }
}

impl Default for LocalEventBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalEventBridge {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` is how far an observer may fall behind before it starts
    /// losing events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_limits(capacity, DEFAULT_MAX_RETAINED)
    }

    /// Like [`with_capacity`](Self::with_capacity), also bounding how many state
    /// topics are retained for replay.
    pub fn with_limits(capacity: usize, max_retained: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Arc::new(Mutex::new(BridgeState {
                next_seq: 1,
                retained: HashMap::new(),
                max_retained: max_retained.max(1),
                sender: Some(sender),
            })),
        }
    }

    /// Emit an event to all current observers.
    ///
    /// Returns the sequence number assigned to the event, or `None` if the bridge
    /// has been closed.
    pub fn emit(&self, mut event: LocalEvent) -> Option<u64> {
        let mut state = self.state.lock();
        let sender = state.sender.clone()?;

        event.seq = state.next_seq;
        state.next_seq += 1;

        if event.kind == EventKind::State {
            state.retain(event.clone());
        }

        let seq = event.seq;
        // Err only means nobody is observing right now.
        let _ = sender.send(event);
        Some(seq)
    }

    /// Forward a pub/sub message into the bridge.
    pub fn emit_message(&self, message: PubSubMessage) -> Option<u64> {
        self.emit(LocalEvent::from_message(message))
    }

    /// Observe every event.
    pub fn observe(&self) -> EventStream {
        self.observe_filtered(None)
    }

    /// Observe events matching `predicate`.
    pub fn observe_where<F>(&self, predicate: F) -> EventStream
    where
        F: Fn(&LocalEvent) -> bool + Send + Sync + 'static,
    {
        self.observe_filtered(Some(Arc::new(predicate)))
    }

    /// Observe a single topic.
    pub fn observe_topic(&self, topic: impl Into<String>) -> EventStream {
        let topic = topic.into();
        self.observe_where(move |event| event.topic == topic)
    }

    pub fn observe_filtered(&self, filter: Option<EventFilter>) -> EventStream {
        let state = self.state.lock();

        // Subscribe and snapshot under the same lock so an event is either in
        // the replay set or in the live stream, never both or neither.
        let live = state
            .sender
            .as_ref()
            .map(|sender| BroadcastStream::new(sender.subscribe()));

        let mut replay: Vec<LocalEvent> = state
            .retained
            .values()
            .filter(|event| filter.as_ref().is_none_or(|f| f(event)))
            .cloned()
            .collect();
        replay.sort_by_key(|event| event.seq);

        EventStream {
            replay: replay.into(),
            live,
            filter,
        }
    }

    /// Latest retained state event for `topic`.
    pub fn latest(&self, topic: &str) -> Option<LocalEvent> {
        self.state.lock().retained.get(topic).cloned()
    }

    /// Tear the bridge down: observers drain and then end, further emits are ignored.
    pub fn close(&self) {
        self.state.lock().sender = None;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().sender.is_none()
    }

    pub fn observer_count(&self) -> usize {
        self.state
            .lock()
            .sender
            .as_ref()
            .map_or(0, |sender| sender.receiver_count())
    }
}

/// Stream of bridge events for one observer: retained state first, then live events.
pub struct EventStream {
    replay: VecDeque<LocalEvent>,
    live: Option<BroadcastStream<LocalEvent>>,
    filter: Option<EventFilter>,
}

impl EventStream {
    /// Wait for the next event; `None` once the bridge is closed.
    pub async fn recv(&mut self) -> Option<LocalEvent> {
        self.next().await
    }
}

impl Stream for EventStream {
    type Item = LocalEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(event) = self.replay.pop_front() {
            return Poll::Ready(Some(event));
        }

        loop {
            let this = &mut *self;
            let Some(live) = this.live.as_mut() else {
                return Poll::Ready(None);
            };

            match Pin::new(live).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    if this.filter.as_ref().is_none_or(|f| f(&event)) {
                        return Poll::Ready(Some(event));
                    }
                }
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(missed)))) => {
                    debug!(missed, "bridge observer lagged; events dropped");
                }
                Poll::Ready(None) => {
                    this.live = None;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
