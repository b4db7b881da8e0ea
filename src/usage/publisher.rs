//! Bounded, non-blocking usage event dispatch.

use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{PublishError, UsageEvent, UsageSink};

/// Delivery counters shared by the publisher and its workers.
#[derive(Debug, Default)]
pub struct PublisherStats {
    published: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl PublisherStats {
    /// Events the sink accepted.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Events discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Events the sink rejected.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Handle for enqueueing usage events.
///
/// Cloning is cheap; all clones feed the same queue. When the queue is full,
/// new events are dropped and counted rather than waited on.
#[derive(Debug, Clone)]
pub struct UsageEventPublisher {
    tx: mpsc::Sender<UsageEvent>,
    stats: Arc<PublisherStats>,
}

/// Owns the worker tasks behind a [`UsageEventPublisher`].
pub struct PublisherHandle {
    workers: Vec<JoinHandle<()>>,
    stats: Arc<PublisherStats>,
}

impl UsageEventPublisher {
    /// Start `worker_count` workers draining a queue of `queue_capacity` events into `sink`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        sink: Arc<dyn UsageSink>,
        queue_capacity: usize,
        worker_count: usize,
    ) -> (Self, PublisherHandle) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let stats = Arc::new(PublisherStats::default());

        info!(
            sink = sink.name(),
            queue_capacity,
            worker_count,
            "Starting usage event publisher"
        );

        let workers = (0..worker_count.max(1))
            .map(|id| {
                tokio::spawn(run_worker(id, rx.clone(), sink.clone(), stats.clone()))
            })
            .collect();

        (
            Self {
                tx,
                stats: stats.clone(),
            },
            PublisherHandle { workers, stats },
        )
    }

    /// Enqueue an event without waiting.
    pub fn publish(&self, event: UsageEvent) -> Result<(), PublishError> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Err(PublishError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(PublishError::Closed),
        }
    }

    /// Delivery counters.
    pub fn stats(&self) -> Arc<PublisherStats> {
        self.stats.clone()
    }
}

impl PublisherHandle {
    /// Wait for the workers to drain the queue and exit.
    ///
    /// Workers exit once every [`UsageEventPublisher`] clone has been dropped
    /// and the queue is empty.
    pub async fn join(self) {
        join_all(self.workers).await;
        info!(
            published = self.stats.published(),
            dropped = self.stats.dropped(),
            failed = self.stats.failed(),
            "Usage event publisher stopped"
        );
    }

    /// Stop the workers immediately, discarding queued events.
    pub fn abort(&self) {
        for worker in &self.workers {
            worker.abort();
        }
    }

    /// Delivery counters.
    pub fn stats(&self) -> Arc<PublisherStats> {
        self.stats.clone()
    }
}

async fn run_worker(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<UsageEvent>>>,
    sink: Arc<dyn UsageSink>,
    stats: Arc<PublisherStats>,
) {
    loop {
        // Hold the lock only while waiting for the next event.
        let next = { rx.lock().await.recv().await };
        let Some(event) = next else { break };

        match sink.publish(&event).await {
            Ok(()) => {
                stats.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    worker = id,
                    sink = sink.name(),
                    subject = %event.subject,
                    resource = %event.resource,
                    error = %e,
                    "Failed to publish usage event"
                );
            }
        }
    }

    debug!(worker = id, "Usage worker exiting");
}
