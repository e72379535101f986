//! Infrastructure-backed broadcasters and the bridge relay.
//!
//! The `Broadcaster` abstraction and the in-memory implementation live in
//! `fintrack-events`. This module provides the Redis implementation and the
//! relay that feeds pub/sub traffic into a process's local event bridge.

#[cfg(feature = "redis")]
pub mod redis_pubsub;
pub mod relay;

#[cfg(feature = "redis")]
pub use redis_pubsub::RedisBroadcaster;
pub use relay::BridgeRelay;
