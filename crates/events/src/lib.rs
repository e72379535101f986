//! Cross-process signalling and in-process event fan-out.
//!
//! - [`Broadcaster`]: best-effort pub/sub between processes (no persistence).
//! - [`LocalEventBridge`]: per-process multicast of remote signals and local state.
//! - [`Signal`] / [`AuditEvent`]: the well-known payloads that travel over them.

pub mod audit;
pub mod bridge;
pub mod bus;
pub mod in_memory_bus;
pub mod message;
pub mod signal;

pub use audit::{AuditAction, AuditEvent};
pub use bridge::{EventFilter, EventKind, EventOrigin, EventStream, LocalEvent, LocalEventBridge};
pub use bus::{subscribe_with, BroadcastError, Broadcaster, Subscription, SubscriptionHandle};
pub use in_memory_bus::InMemoryBroadcaster;
pub use message::PubSubMessage;
pub use signal::{channels, Signal};
