//! Well-known cross-process signals.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use fintrack_core::{ChannelName, JobId, QueueName};

use crate::bridge::{EventKind, LocalEvent};

/// Channel names shared by every process.
pub mod channels {
    pub const TOKEN_REVOKED: &str = "fintrack:auth:token-revoked";
    pub const ACCESS_TOKEN: &str = "fintrack:auth:access-token";
    pub const CONFIG_CHANGED: &str = "fintrack:config:changed";
    pub const JOB_EVENTS: &str = "fintrack:jobs:events";

    /// Channels a process relays into its local bridge by default.
    pub const DEFAULT_RELAYED: [&str; 4] = [TOKEN_REVOKED, ACCESS_TOKEN, CONFIG_CHANGED, JOB_EVENTS];
}

/// A signal payload. Serialized with a `signal` tag so receivers can tell known
/// signals from arbitrary JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
    /// A session's tokens must no longer be accepted.
    TokenRevoked {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        actor_id: Option<String>,
    },
    /// The current access token needs (or no longer needs) a refresh.
    AccessTokenRefresh { needed: bool },
    /// A runtime configuration value changed.
    ConfigChanged { key: String, value: JsonValue },
    /// A job finished successfully. Liveness hint only; the queue store is authoritative.
    JobCompleted { queue: QueueName, job_id: JobId },
}

impl Signal {
    /// Bridge topic this signal is surfaced under.
    pub fn topic(&self) -> String {
        match self {
            Signal::TokenRevoked { .. } => "auth.token_revoked".to_string(),
            Signal::AccessTokenRefresh { .. } => "auth.access_token_refresh".to_string(),
            Signal::ConfigChanged { key, .. } => format!("config.{key}"),
            Signal::JobCompleted { .. } => "jobs.completed".to_string(),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Signal::AccessTokenRefresh { .. } | Signal::ConfigChanged { .. } => EventKind::State,
            Signal::TokenRevoked { .. } | Signal::JobCompleted { .. } => EventKind::Notification,
        }
    }

    /// Channel this signal is published on.
    pub fn channel(&self) -> ChannelName {
        let name = match self {
            Signal::TokenRevoked { .. } => channels::TOKEN_REVOKED,
            Signal::AccessTokenRefresh { .. } => channels::ACCESS_TOKEN,
            Signal::ConfigChanged { .. } => channels::CONFIG_CHANGED,
            Signal::JobCompleted { .. } => channels::JOB_EVENTS,
        };
        ChannelName::from_static(name)
    }

    pub fn to_payload(&self) -> JsonValue {
        // Serializing a plain enum of strings/JSON cannot fail.
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    pub fn from_payload(payload: &JsonValue) -> Option<Self> {
        if payload.get("signal").is_none() {
            return None;
        }
        serde_json::from_value(payload.clone()).ok()
    }

    /// Local (not yet emitted) bridge event carrying this signal.
    pub fn to_local_event(&self) -> LocalEvent {
        match self.kind() {
            EventKind::State => LocalEvent::state(self.topic(), self.to_payload()),
            EventKind::Notification => LocalEvent::notification(self.topic(), self.to_payload()),
        }
    }
}
