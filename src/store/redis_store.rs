//! Redis sorted-set window store.
//!
//! Each window is a sorted set whose members are request tokens and whose
//! scores are admission timestamps in epoch milliseconds.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult, Script};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::{AtomicAdmission, StoreError, WindowCheck, WindowStore};

/// Evict, count, and conditionally insert in a single server-side step.
///
/// Returns `{admitted, count}` where `admitted` is 1 or 0.
const ADMIT_SCRIPT: &str = r#"
local key = KEYS[1]
local window_start = tonumber(ARGV[1])
local score = tonumber(ARGV[2])
local member = ARGV[3]
local limit = tonumber(ARGV[4])
local ttl_seconds = tonumber(ARGV[5])

redis.call("ZREMRANGEBYSCORE", key, 0, window_start)

local count = redis.call("ZCARD", key)
if count >= limit then
    return {0, count}
end

redis.call("ZADD", key, score, member)
redis.call("EXPIRE", key, ttl_seconds)

return {1, count + 1}
"#;

/// A [`WindowStore`] backed by Redis sorted sets.
#[derive(Clone)]
pub struct RedisWindowStore {
    connection: ConnectionManager,
    op_timeout: Duration,
    admit_script: Script,
}

impl std::fmt::Debug for RedisWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisWindowStore")
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

impl RedisWindowStore {
    /// Open a managed connection to `url`.
    ///
    /// The connection is established eagerly so a misconfigured URL fails at
    /// startup rather than on the first request.
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        info!(op_timeout = ?op_timeout, "Connecting to Redis window store");

        let client = redis::Client::open(url)?;
        let connection =
            with_timeout("CONNECT", op_timeout, client.get_connection_manager()).await?;

        Ok(Self::new(connection, op_timeout))
    }

    /// Wrap an existing connection manager.
    pub fn new(connection: ConnectionManager, op_timeout: Duration) -> Self {
        Self {
            connection,
            op_timeout,
            admit_script: Script::new(ADMIT_SCRIPT),
        }
    }

    /// A handle to the underlying connection, shared with other Redis users.
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

/// Bound a Redis call by `timeout` and fold both failure kinds into [`StoreError`].
async fn with_timeout<T, F>(op: &'static str, timeout: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = RedisResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            warn!(op, error = %e, "Redis operation failed");
            Err(StoreError::Redis(e))
        }
        Err(_) => {
            warn!(op, timeout = ?timeout, "Redis operation timed out");
            Err(StoreError::Timeout { op, timeout })
        }
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn remove_range_by_score(
        &self,
        key: &str,
        min_score: i64,
        max_score: i64,
    ) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let removed: u64 = with_timeout(
            "ZREMRANGEBYSCORE",
            self.op_timeout,
            conn.zrembyscore(key, min_score, max_score),
        )
        .await?;

        trace!(key, min_score, max_score, removed, "Removed range by score");
        Ok(removed)
    }

    async fn cardinality(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        with_timeout("ZCARD", self.op_timeout, conn.zcard(key)).await
    }

    async fn add_member(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: i64 = with_timeout("ZADD", self.op_timeout, conn.zadd(key, member, score)).await?;
        Ok(())
    }

    async fn set_expiry(&self, key: &str, seconds: u64) -> Result<(), StoreError> {
        let seconds = i64::try_from(seconds).unwrap_or(i64::MAX);
        let mut conn = self.connection.clone();
        let _: i64 =
            with_timeout("EXPIRE", self.op_timeout, conn.expire(key, seconds)).await?;
        Ok(())
    }

    async fn admit_atomic(
        &self,
        key: &str,
        check: &WindowCheck,
    ) -> Result<AtomicAdmission, StoreError> {
        let mut conn = self.connection.clone();

        let (admitted, count): (i64, u64) = with_timeout(
            "EVALSHA",
            self.op_timeout,
            self.admit_script
                .key(key)
                .arg(check.window_start)
                .arg(check.score)
                .arg(&check.member)
                .arg(check.limit)
                .arg(check.ttl_seconds)
                .invoke_async(&mut conn),
        )
        .await?;

        debug!(key, admitted, count, "Atomic window check");
        Ok(AtomicAdmission {
            admitted: admitted == 1,
            count,
        })
    }
}
