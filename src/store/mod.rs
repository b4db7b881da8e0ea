//! The shared window store.
//!
//! A window store holds, per key, an ordered collection of (member, score)
//! pairs with key expiry. Every service instance talks to the same store, so
//! the store is the only place where window state lives.

mod memory;
mod redis_store;

pub use self::memory::InMemoryWindowStore;
pub use self::redis_store::RedisWindowStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by window store operations.
///
/// Every variant means the store could not give an answer; none of them is
/// retried by the caller.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The Redis client reported a failure
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// The operation did not complete in time
    #[error("{op} timed out after {timeout:?}")]
    Timeout {
        /// The store operation that timed out
        op: &'static str,
        /// The configured deadline
        timeout: Duration,
    },

    /// Any other reason the store cannot be used
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Input for a single-unit admission check on the store side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowCheck {
    /// Entries with a score in `[0, window_start]` are evicted first
    pub window_start: i64,
    /// Member to insert when admitted
    pub member: String,
    /// Score to insert when admitted
    pub score: i64,
    /// Maximum number of entries allowed in the window
    pub limit: u64,
    /// Key expiry applied after an insert
    pub ttl_seconds: u64,
}

/// Outcome of [`WindowStore::admit_atomic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicAdmission {
    /// Whether the member was inserted
    pub admitted: bool,
    /// Entries in the window after the check
    pub count: u64,
}

/// Operations the rate limiter needs from the shared store.
///
/// All operations address a single key. Implementations must make each
/// operation atomic on its own; `admit_atomic` must additionally run its whole
/// evict/count/insert/expire sequence as one unit.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Remove members whose score lies in `[min_score, max_score]` (inclusive).
    ///
    /// Returns the number of removed members.
    async fn remove_range_by_score(
        &self,
        key: &str,
        min_score: i64,
        max_score: i64,
    ) -> Result<u64, StoreError>;

    /// Number of members stored under `key`. A missing key has zero members.
    async fn cardinality(&self, key: &str) -> Result<u64, StoreError>;

    /// Insert `member` with `score`, replacing the score of an existing member.
    async fn add_member(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError>;

    /// Expire `key` after `seconds`. A missing key is left alone.
    async fn set_expiry(&self, key: &str, seconds: u64) -> Result<(), StoreError>;

    /// Evict, count, and conditionally insert as one indivisible unit.
    async fn admit_atomic(
        &self,
        key: &str,
        check: &WindowCheck,
    ) -> Result<AtomicAdmission, StoreError>;
}
