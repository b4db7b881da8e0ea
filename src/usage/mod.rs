//! Usage event publication.
//!
//! Every admitted request produces a [`UsageEvent`]. Events are handed to a
//! bounded queue and delivered to a [`UsageSink`] by a pool of worker tasks,
//! so delivery never sits on the admission path.

mod publisher;
mod sink;

pub use publisher::{PublisherHandle, PublisherStats, UsageEventPublisher};
pub use sink::{LogSink, RedisStreamSink, UsageSink};

use serde::Serialize;
use thiserror::Error;

/// Errors raised while publishing usage events.
///
/// None of these ever reaches a caller of the rate limiter.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The queue was full and the event was dropped
    #[error("usage queue is full")]
    QueueFull,

    /// The workers have shut down
    #[error("usage queue is closed")]
    Closed,

    /// The sink rejected the event
    #[error("sink error: {0}")]
    Sink(String),
}

impl From<redis::RedisError> for PublishError {
    fn from(err: redis::RedisError) -> Self {
        PublishError::Sink(err.to_string())
    }
}

/// A record of one admitted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageEvent {
    /// The caller identity
    pub subject: String,
    /// The resource that was called
    pub resource: String,
    /// Admission time in epoch milliseconds
    pub timestamp_ms: i64,
}

impl UsageEvent {
    /// Create a new usage event.
    pub fn new(subject: &str, resource: &str, timestamp_ms: i64) -> Self {
        Self {
            subject: subject.to_string(),
            resource: resource.to_string(),
            timestamp_ms,
        }
    }
}

impl std::fmt::Display for UsageEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "User:{} API:{} Timestamp:{}",
            self.subject, self.resource, self.timestamp_ms
        )
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Keeps every event it receives.
    #[derive(Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<UsageEvent>>,
    }

    impl RecordingSink {
        pub fn events(&self) -> Vec<UsageEvent> {
            self.events.lock().clone()
        }
    }

    #[async_trait]
    impl UsageSink for RecordingSink {
        async fn publish(&self, event: &UsageEvent) -> Result<(), PublishError> {
            self.events.lock().push(event.clone());
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    /// Rejects every event.
    pub struct FailingSink;

    #[async_trait]
    impl UsageSink for FailingSink {
        async fn publish(&self, _event: &UsageEvent) -> Result<(), PublishError> {
            Err(PublishError::Sink("broker unreachable".to_string()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_message_format() {
        let event = UsageEvent::new("alice", "api1", 1_700_000_000_000);
        assert_eq!(event.to_string(), "User:alice API:api1 Timestamp:1700000000000");
    }

    #[test]
    fn test_event_serializes_fields() {
        let event = UsageEvent::new("bob", "api2", 42);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["subject"], "bob");
        assert_eq!(json["resource"], "api2");
        assert_eq!(json["timestamp_ms"], 42);
    }
}
