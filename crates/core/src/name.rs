//! Validated names for queues and pub/sub channels.
//!
//! Both end up embedded in Redis keys, so they are restricted to a conservative
//! character set and compared by value.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

const MAX_NAME_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("name must not be empty")]
    Empty,
    #[error("name exceeds 128 characters")]
    TooLong,
    #[error("name contains invalid character {0:?}")]
    InvalidChar(char),
}

fn validate(raw: &str, allow: impl Fn(char) -> bool) -> Result<(), NameError> {
    if raw.is_empty() {
        return Err(NameError::Empty);
    }
    if raw.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong);
    }
    match raw.chars().find(|c| !allow(*c)) {
        Some(c) => Err(NameError::InvalidChar(c)),
        None => Ok(()),
    }
}

/// Name of a logical job queue (e.g. `audit-log`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    pub fn new(raw: impl Into<String>) -> Result<Self, NameError> {
        let raw = raw.into();
        validate(&raw, |c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Name of a pub/sub channel (e.g. `fintrack:auth:token-revoked`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelName(String);

impl ChannelName {
    pub fn new(raw: impl Into<String>) -> Result<Self, NameError> {
        let raw = raw.into();
        validate(&raw, |c| {
            c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')
        })?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! impl_name {
    ($t:ty) => {
        impl $t {
            /// Build a name from a compile-time constant.
            ///
            /// Panics if the constant is not a valid name.
            pub fn from_static(raw: &'static str) -> Self {
                match Self::new(raw) {
                    Ok(name) => name,
                    Err(e) => panic!("invalid static name {raw:?}: {e}"),
                }
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $t {
            type Err = NameError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $t {
            type Error = NameError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }
    };
}

impl_name!(QueueName);
impl_name!(ChannelName);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn queue_names_reject_separators() {
        assert!(QueueName::new("audit-log").is_ok());
        assert_eq!(QueueName::new(""), Err(NameError::Empty));
        assert_eq!(QueueName::new("a:b"), Err(NameError::InvalidChar(':')));
        assert_eq!(QueueName::new("a b"), Err(NameError::InvalidChar(' ')));
    }

    #[test]
    fn channel_names_allow_namespacing() {
        let ch = ChannelName::new("fintrack:auth:token-revoked").unwrap();
        assert_eq!(ch.as_str(), "fintrack:auth:token-revoked");
    }

    #[test]
    fn serde_validates_on_deserialize() {
        let ok: QueueName = serde_json::from_str("\"messages\"").unwrap();
        assert_eq!(ok.as_str(), "messages");
        assert!(serde_json::from_str::<QueueName>("\"bad name\"").is_err());
    }

    proptest! {
        #[test]
        fn valid_queue_names_round_trip(raw in "[a-z0-9_.-]{1,64}") {
            let name = QueueName::new(raw.clone()).unwrap();
            prop_assert_eq!(name.to_string(), raw);
        }
    }
}
