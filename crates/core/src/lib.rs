//! `fintrack-core`: shared building blocks for the background-processing core.
//!
//! This crate holds **pure** primitives (no IO, no runtime): identifiers, validated
//! queue/channel names and the configuration error used across the workspace.

pub mod error;
pub mod id;
pub mod name;

pub use error::ConfigError;
pub use id::{JobId, LeaseToken};
pub use name::{ChannelName, NameError, QueueName};
