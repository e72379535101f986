//! Idempotency keys, request fingerprints and records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use fintrack_core::LeaseToken;

use crate::jobs::types::to_chrono;

/// Longest accepted idempotency key.
pub const MAX_KEY_LEN: usize = 255;

/// Key validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("idempotency key is required")]
    Missing,
    #[error("invalid idempotency key: {0}")]
    Invalid(String),
}

/// A client-supplied idempotency key: 1-255 visible ASCII characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Validate a raw header value. `None` (header absent) is [`KeyError::Missing`].
    pub fn parse(raw: Option<&str>) -> Result<Self, KeyError> {
        let raw = raw.ok_or(KeyError::Missing)?.trim();
        if raw.is_empty() {
            return Err(KeyError::Missing);
        }
        if raw.len() > MAX_KEY_LEN {
            return Err(KeyError::Invalid(format!(
                "must be at most {MAX_KEY_LEN} characters"
            )));
        }
        if let Some(c) = raw.chars().find(|c| !c.is_ascii_graphic()) {
            return Err(KeyError::Invalid(format!("unexpected character {c:?}")));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// SHA-256 over the parts of a request that define "the same operation".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestFingerprint(String);

impl RequestFingerprint {
    /// Fingerprint of `method`, `target` (path and query) and `body`.
    pub fn compute(method: &str, target: &str, body: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        // Length prefixes keep ("a", "bc") and ("ab", "c") apart.
        for part in [method.as_bytes(), target.as_bytes(), body] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap a stored hex digest.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    /// The first request is still executing.
    Pending,
    /// Finished; `response` holds the snapshot replayed to duplicates.
    Completed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::Pending => "pending",
            IdempotencyStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(IdempotencyStatus::Pending),
            "completed" => Some(IdempotencyStatus::Completed),
            _ => None,
        }
    }
}

/// What the store knows about one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub fingerprint: RequestFingerprint,
    pub status: IdempotencyStatus,
    /// Minted per `begin`; only the claim holding it may complete or release
    /// the record.
    pub owner: LeaseToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn pending(key: IdempotencyKey, fingerprint: RequestFingerprint, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            key,
            fingerprint,
            status: IdempotencyStatus::Pending,
            owner: LeaseToken::new(),
            response: None,
            created_at: now,
            expires_at: now + to_chrono(ttl),
        }
    }

    pub fn complete(&mut self, response: JsonValue, ttl: Duration) {
        self.status = IdempotencyStatus::Completed;
        self.response = Some(response);
        self.expires_at = Utc::now() + to_chrono(ttl);
    }

    pub fn is_owned_by(&self, owner: &LeaseToken) -> bool {
        self.status == IdempotencyStatus::Pending && &self.owner == owner
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_validated() {
        assert_eq!(IdempotencyKey::parse(None), Err(KeyError::Missing));
        assert_eq!(IdempotencyKey::parse(Some("  ")), Err(KeyError::Missing));
        assert!(matches!(
            IdempotencyKey::parse(Some("has space")),
            Err(KeyError::Invalid(_))
        ));
        assert!(matches!(
            IdempotencyKey::parse(Some(&"k".repeat(256))),
            Err(KeyError::Invalid(_))
        ));
        assert_eq!(
            IdempotencyKey::parse(Some("k1")).unwrap().as_str(),
            "k1"
        );
    }

    #[test]
    fn fingerprint_depends_on_every_part() {
        let base = RequestFingerprint::compute("POST", "/messages", b"{\"a\":1}");
        assert_eq!(base, RequestFingerprint::compute("POST", "/messages", b"{\"a\":1}"));
        assert_ne!(base, RequestFingerprint::compute("PUT", "/messages", b"{\"a\":1}"));
        assert_ne!(base, RequestFingerprint::compute("POST", "/messages?x=1", b"{\"a\":1}"));
        assert_ne!(base, RequestFingerprint::compute("POST", "/messages", b"{\"a\":2}"));
        assert_eq!(base.as_str().len(), 64);
    }

    #[test]
    fn part_boundaries_matter() {
        assert_ne!(
            RequestFingerprint::compute("POST", "/ab", b"c"),
            RequestFingerprint::compute("POST", "/a", b"bc")
        );
    }

    #[test]
    fn record_json_form_is_stable() {
        let record = IdempotencyRecord::pending(
            IdempotencyKey::parse(Some("k1")).unwrap(),
            RequestFingerprint::from_hex("abc"),
            Duration::from_secs(60),
        );
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["key"], "k1");
        assert_eq!(value["fingerprint"], "abc");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["owner"], record.owner.to_string());
        assert!(value.get("response").is_none());
    }

    #[test]
    fn each_pending_record_gets_its_own_owner() {
        let key = IdempotencyKey::parse(Some("k1")).unwrap();
        let fingerprint = RequestFingerprint::from_hex("abc");
        let first = IdempotencyRecord::pending(key.clone(), fingerprint.clone(), Duration::ZERO);
        let mut second = IdempotencyRecord::pending(key, fingerprint, Duration::ZERO);

        assert_ne!(first.owner, second.owner);
        assert!(second.is_owned_by(&second.owner));
        assert!(!second.is_owned_by(&first.owner));

        let owner = second.owner;
        second.complete(serde_json::json!(1), Duration::ZERO);
        assert!(!second.is_owned_by(&owner));
    }
}
