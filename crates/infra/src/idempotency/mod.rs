//! Idempotency Guard: keys, fingerprints, record stores and the guard itself.

pub mod guard;
pub mod postgres;
pub mod record;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod store;

pub use guard::{Execution, GuardConfig, IdempotencyError, IdempotencyGuard};
pub use postgres::PostgresIdempotencyStore;
pub use record::{
    IdempotencyKey, IdempotencyRecord, IdempotencyStatus, KeyError, MAX_KEY_LEN, RequestFingerprint,
};
#[cfg(feature = "redis")]
pub use redis_store::RedisIdempotencyStore;
pub use store::{BeginOutcome, IdempotencyStore, IdempotencyStoreError, InMemoryIdempotencyStore};
