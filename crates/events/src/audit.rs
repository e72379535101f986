//! Audit events: the payload of the audit-log queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The fixed set of auditable actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Login,
    Logout,
    LoginFailed,
    TokenRefreshed,
    TokenRevoked,
    SessionCreated,
    SessionEnded,
    AccountCreated,
    AccountUpdated,
    AccountDeleted,
    CategoryCreated,
    CategoryUpdated,
    CategoryDeleted,
    EntityCreated,
    EntityUpdated,
    EntityDeleted,
    CurrencyCreated,
    CurrencyUpdated,
    CurrencyDeleted,
    RoleCreated,
    RoleUpdated,
    RoleDeleted,
    RoleAssigned,
    RoleRevoked,
    PermissionGranted,
    PermissionRevoked,
    ConfigChanged,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Login => "login",
            AuditAction::Logout => "logout",
            AuditAction::LoginFailed => "login_failed",
            AuditAction::TokenRefreshed => "token_refreshed",
            AuditAction::TokenRevoked => "token_revoked",
            AuditAction::SessionCreated => "session_created",
            AuditAction::SessionEnded => "session_ended",
            AuditAction::AccountCreated => "account_created",
            AuditAction::AccountUpdated => "account_updated",
            AuditAction::AccountDeleted => "account_deleted",
            AuditAction::CategoryCreated => "category_created",
            AuditAction::CategoryUpdated => "category_updated",
            AuditAction::CategoryDeleted => "category_deleted",
            AuditAction::EntityCreated => "entity_created",
            AuditAction::EntityUpdated => "entity_updated",
            AuditAction::EntityDeleted => "entity_deleted",
            AuditAction::CurrencyCreated => "currency_created",
            AuditAction::CurrencyUpdated => "currency_updated",
            AuditAction::CurrencyDeleted => "currency_deleted",
            AuditAction::RoleCreated => "role_created",
            AuditAction::RoleUpdated => "role_updated",
            AuditAction::RoleDeleted => "role_deleted",
            AuditAction::RoleAssigned => "role_assigned",
            AuditAction::RoleRevoked => "role_revoked",
            AuditAction::PermissionGranted => "permission_granted",
            AuditAction::PermissionRevoked => "permission_revoked",
            AuditAction::ConfigChanged => "config_changed",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn empty_context() -> JsonValue {
    JsonValue::Object(Default::default())
}

/// One auditable action performed by an actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub action: AuditAction,
    pub actor_id: String,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
    /// Free-form details (ids touched, client info, ...).
    #[serde(default = "empty_context")]
    pub context: JsonValue,
}

impl AuditEvent {
    pub fn new(action: AuditAction, actor_id: impl Into<String>) -> Self {
        Self {
            action,
            actor_id: actor_id.into(),
            occurred_at: Utc::now(),
            context: empty_context(),
        }
    }

    pub fn with_context(mut self, context: JsonValue) -> Self {
        self.context = context;
        self
    }
}
