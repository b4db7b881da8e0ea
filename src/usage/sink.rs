//! Usage event sinks.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::info;

use super::{PublishError, UsageEvent};

/// Destination for usage events.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Deliver one event.
    async fn publish(&self, event: &UsageEvent) -> Result<(), PublishError>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Emits each event as a structured log record on the `usage` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl UsageSink for LogSink {
    async fn publish(&self, event: &UsageEvent) -> Result<(), PublishError> {
        info!(
            target: "usage",
            subject = %event.subject,
            resource = %event.resource,
            timestamp_ms = event.timestamp_ms,
            "{}",
            event
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Appends each event to a capped Redis stream for downstream consumers.
pub struct RedisStreamSink {
    connection: ConnectionManager,
    stream_key: String,
    max_len: u64,
    op_timeout: Duration,
}

impl RedisStreamSink {
    /// Create a sink writing to `stream_key`, trimmed to roughly `max_len` entries.
    pub fn new(
        connection: ConnectionManager,
        stream_key: &str,
        max_len: u64,
        op_timeout: Duration,
    ) -> Self {
        Self {
            connection,
            stream_key: stream_key.to_string(),
            max_len,
            op_timeout,
        }
    }
}

#[async_trait]
impl UsageSink for RedisStreamSink {
    async fn publish(&self, event: &UsageEvent) -> Result<(), PublishError> {
        let mut conn = self.connection.clone();

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream_key)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*")
            .arg("subject")
            .arg(&event.subject)
            .arg("resource")
            .arg(&event.resource)
            .arg("timestamp")
            .arg(event.timestamp_ms)
            .arg("message")
            .arg(event.to_string());

        let _entry_id: String =
            tokio::time::timeout(self.op_timeout, cmd.query_async(&mut conn))
                .await
                .map_err(|_| {
                    PublishError::Sink(format!("XADD timed out after {:?}", self.op_timeout))
                })??;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis_stream"
    }
}
