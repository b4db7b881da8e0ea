//! Process-local window store.
//!
//! Mirrors the sorted-set semantics of the Redis store closely enough that the
//! rate limiter behaves identically on both. Only useful when a single
//! instance enforces the quota.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{AtomicAdmission, StoreError, WindowCheck, WindowStore};
use crate::ratelimit::Clock;

#[derive(Debug, Default)]
struct Window {
    /// member -> score
    members: HashMap<String, i64>,
    /// Absolute expiry in epoch milliseconds
    expires_at: Option<i64>,
}

impl Window {
    fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    fn remove_range(&mut self, min_score: i64, max_score: i64) -> u64 {
        let before = self.members.len();
        self.members
            .retain(|_, score| *score < min_score || *score > max_score);
        (before - self.members.len()) as u64
    }
}

/// Expiry in milliseconds, saturating instead of wrapping.
fn ttl_millis(seconds: u64) -> i64 {
    i64::try_from(seconds)
        .ok()
        .and_then(|secs| secs.checked_mul(1000))
        .unwrap_or(i64::MAX)
}

/// An in-memory [`WindowStore`].
///
/// Each key is guarded by its own shard lock, which is what makes
/// `admit_atomic` indivisible.
pub struct InMemoryWindowStore {
    windows: DashMap<String, Window>,
    clock: Arc<dyn Clock>,
}

impl InMemoryWindowStore {
    /// Create an empty store whose expiry follows `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
        }
    }

    /// Number of keys currently held, including expired keys not yet purged.
    pub fn key_count(&self) -> usize {
        self.windows.len()
    }

    /// Drop every expired key. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.windows.len();
        self.windows.retain(|_, window| !window.is_expired(now));
        let purged = before.saturating_sub(self.windows.len());
        if purged > 0 {
            debug!(purged, "Purged expired windows");
        }
        purged
    }

    /// Periodically purge expired keys until the returned handle is aborted.
    pub fn spawn_purge_task(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.purge_expired();
            }
        })
    }

    /// Lazily expire `key`, as Redis does on access.
    fn expire_if_due(&self, key: &str, now: i64) {
        self.windows.remove_if(key, |_, window| window.is_expired(now));
    }

    /// Redis deletes a sorted set once its last member is gone.
    fn drop_if_empty(&self, key: &str) {
        self.windows.remove_if(key, |_, window| window.members.is_empty());
    }
}

#[async_trait]
impl WindowStore for InMemoryWindowStore {
    async fn remove_range_by_score(
        &self,
        key: &str,
        min_score: i64,
        max_score: i64,
    ) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        self.expire_if_due(key, now);

        let removed = match self.windows.get_mut(key) {
            Some(mut window) => window.remove_range(min_score, max_score),
            None => 0,
        };
        self.drop_if_empty(key);

        trace!(key, min_score, max_score, removed, "Removed range by score");
        Ok(removed)
    }

    async fn cardinality(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        self.expire_if_due(key, now);

        Ok(self
            .windows
            .get(key)
            .map(|window| window.members.len() as u64)
            .unwrap_or(0))
    }

    async fn add_member(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        self.expire_if_due(key, now);

        self.windows
            .entry(key.to_string())
            .or_default()
            .members
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn set_expiry(&self, key: &str, seconds: u64) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        self.expire_if_due(key, now);

        if let Some(mut window) = self.windows.get_mut(key) {
            window.expires_at = Some(now.saturating_add(ttl_millis(seconds)));
        }
        Ok(())
    }

    async fn admit_atomic(
        &self,
        key: &str,
        check: &WindowCheck,
    ) -> Result<AtomicAdmission, StoreError> {
        let now = self.clock.now_millis();

        let outcome = {
            let mut window = self.windows.entry(key.to_string()).or_default();
            if window.is_expired(now) {
                *window = Window::default();
            }

            window.remove_range(0, check.window_start);
            let count = window.members.len() as u64;

            if count >= check.limit {
                AtomicAdmission {
                    admitted: false,
                    count,
                }
            } else {
                window.members.insert(check.member.clone(), check.score);
                window.expires_at = Some(now.saturating_add(ttl_millis(check.ttl_seconds)));
                AtomicAdmission {
                    admitted: true,
                    count: count + 1,
                }
            }
        };

        if !outcome.admitted {
            self.drop_if_empty(key);
        }
        Ok(outcome)
    }
}
