//! Core sliding-window-log rate limiter.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::backend::AdmissionBackend;
use super::clock::{Clock, SystemClock};
use super::key::RateKey;
use super::quota::{AdmissionMode, QuotaConfig};
use super::window::{window_start, WindowEntry};
use crate::error::Result;
use crate::store::{StoreError, WindowCheck, WindowStore};
use crate::usage::{PublishError, UsageEvent, UsageEventPublisher};

/// Outcome of an admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed and has been recorded in its window
    Admitted,
    /// The window is full; nothing was recorded
    Denied,
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted)
    }
}

/// Decides admission for (subject, resource) pairs against a shared window store.
///
/// The limiter keeps no window state of its own. It is safe to share across
/// tasks and to call concurrently for any keys; all coordination happens in
/// the store.
pub struct RateLimiter {
    /// Shared window storage
    store: Arc<dyn WindowStore>,
    /// Immutable quota, fixed at construction
    quota: QuotaConfig,
    /// Time source for `decide`
    clock: Arc<dyn Clock>,
    /// Receives one event per admitted request
    publisher: Option<UsageEventPublisher>,
}

impl RateLimiter {
    /// Create a rate limiter using the system clock and no usage publisher.
    pub fn new(store: Arc<dyn WindowStore>, quota: QuotaConfig) -> Self {
        Self {
            store,
            quota,
            clock: Arc::new(SystemClock),
            publisher: None,
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Publish a usage event for every admitted request.
    pub fn with_publisher(mut self, publisher: UsageEventPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// The quota this limiter enforces.
    pub fn quota(&self) -> &QuotaConfig {
        &self.quota
    }

    /// Decide whether `subject` may call `resource` now.
    pub async fn decide(&self, subject: &str, resource: &str) -> Result<Decision> {
        let now = self.clock.now_millis();
        self.decide_at(subject, resource, now).await
    }

    /// Decide whether `subject` may call `resource` at `now_millis`.
    ///
    /// Replaying the same sequence of calls against an empty store always
    /// produces the same sequence of decisions.
    pub async fn decide_at(
        &self,
        subject: &str,
        resource: &str,
        now_millis: i64,
    ) -> Result<Decision> {
        let key = RateKey::new(subject, resource);
        let store_key = key.to_store_key(&self.quota.key_prefix);
        let limit = self.quota.limit_for(resource);
        let window_start = window_start(now_millis, self.quota.window_millis());

        trace!(
            key = %key,
            now = now_millis,
            window_start,
            limit,
            mode = ?self.quota.mode,
            "Checking rate limit"
        );

        let outcome = match self.quota.mode {
            AdmissionMode::Atomic => {
                self.decide_atomic(&store_key, now_millis, window_start, limit)
                    .await
            }
            AdmissionMode::Sequential => {
                self.decide_sequential(&store_key, now_millis, window_start, limit)
                    .await
            }
        };

        let decision = outcome.map_err(|e| {
            warn!(key = %key, error = %e, "Window store unavailable, no decision made");
            e
        })?;

        match decision {
            Decision::Admitted => self.notify(&key, now_millis),
            Decision::Denied => debug!(key = %key, limit, "Rate limit exceeded"),
        }

        Ok(decision)
    }

    /// Evict, count, insert and expire as four separate store calls.
    ///
    /// Two callers can both read a count below the limit before either
    /// inserts, so the window may briefly hold more than `limit` entries.
    ///
    /// A failure after `add_member` leaves the entry recorded even though the
    /// caller sees `StoreUnavailable`. It counts against the quota without a
    /// usage event, and the key keeps its previous expiry (none on a new key)
    /// until the next admission.
    async fn decide_sequential(
        &self,
        store_key: &str,
        now_millis: i64,
        window_start: i64,
        limit: u64,
    ) -> std::result::Result<Decision, StoreError> {
        self.store
            .remove_range_by_score(store_key, 0, window_start)
            .await?;

        let current_count = self.store.cardinality(store_key).await?;
        if current_count >= limit {
            return Ok(Decision::Denied);
        }

        let entry = WindowEntry::new(now_millis);
        self.store
            .add_member(store_key, &entry.member, entry.score)
            .await?;
        self.store
            .set_expiry(store_key, self.quota.key_ttl_seconds())
            .await?;

        Ok(Decision::Admitted)
    }

    async fn decide_atomic(
        &self,
        store_key: &str,
        now_millis: i64,
        window_start: i64,
        limit: u64,
    ) -> std::result::Result<Decision, StoreError> {
        let entry = WindowEntry::new(now_millis);
        let check = WindowCheck {
            window_start,
            member: entry.member,
            score: entry.score,
            limit,
            ttl_seconds: self.quota.key_ttl_seconds(),
        };

        let outcome = self.store.admit_atomic(store_key, &check).await?;
        Ok(if outcome.admitted {
            Decision::Admitted
        } else {
            Decision::Denied
        })
    }

    /// Hand the admission to the usage publisher. Never fails the decision.
    fn notify(&self, key: &RateKey, now_millis: i64) {
        let Some(publisher) = &self.publisher else {
            return;
        };

        let event = UsageEvent::new(&key.subject, &key.resource, now_millis);
        match publisher.publish(event) {
            Ok(()) => {}
            Err(PublishError::QueueFull) => {
                debug!(key = %key, "Usage queue full, event dropped");
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Usage event not published");
            }
        }
    }
}

#[async_trait]
impl AdmissionBackend for RateLimiter {
    async fn decide(&self, subject: &str, resource: &str) -> Result<Decision> {
        RateLimiter::decide(self, subject, resource).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrafficGateError;
    use crate::ratelimit::ManualClock;
    use crate::store::{AtomicAdmission, InMemoryWindowStore};
    use crate::usage::test_support::{FailingSink, RecordingSink};

    const SECOND: i64 = 1_000;
    const MODES: [AdmissionMode; 2] = [AdmissionMode::Atomic, AdmissionMode::Sequential];

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryWindowStore>,
        limiter: RateLimiter,
    }

    fn harness(window_size_seconds: u64, limit: u64, mode: AdmissionMode) -> Harness {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(InMemoryWindowStore::new(clock.clone()));
        let quota = QuotaConfig::new(window_size_seconds, limit).with_mode(mode);
        let limiter = RateLimiter::new(store.clone(), quota).with_clock(clock.clone());
        Harness {
            clock,
            store,
            limiter,
        }
    }

    /// A store that is never reachable.
    struct UnreachableStore;

    #[async_trait]
    impl WindowStore for UnreachableStore {
        async fn remove_range_by_score(
            &self,
            _: &str,
            _: i64,
            _: i64,
        ) -> std::result::Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn cardinality(&self, _: &str) -> std::result::Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn add_member(
            &self,
            _: &str,
            _: &str,
            _: i64,
        ) -> std::result::Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn set_expiry(&self, _: &str, _: u64) -> std::result::Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn admit_atomic(
            &self,
            _: &str,
            _: &WindowCheck,
        ) -> std::result::Result<AtomicAdmission, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_admits_up_to_limit_then_denies() {
        for mode in MODES {
            let h = harness(60, 3, mode);
            let mut outcomes = Vec::new();

            for t in 0..4 {
                h.clock.set(t * SECOND);
                outcomes.push(h.limiter.decide("alice", "api1").await.unwrap());
            }

            assert_eq!(
                outcomes,
                vec![
                    Decision::Admitted,
                    Decision::Admitted,
                    Decision::Admitted,
                    Decision::Denied
                ],
                "mode {:?}",
                mode
            );

            // The t=0 entry has aged out of the window by t=61s.
            h.clock.set(61 * SECOND);
            assert_eq!(
                h.limiter.decide("alice", "api1").await.unwrap(),
                Decision::Admitted,
                "mode {:?}",
                mode
            );
        }
    }

    #[tokio::test]
    async fn test_different_resources_have_separate_windows() {
        for mode in MODES {
            let h = harness(60, 1, mode);

            let first = h.limiter.decide("bob", "api1").await.unwrap();
            let second = h.limiter.decide("bob", "api2").await.unwrap();

            assert_eq!(first, Decision::Admitted);
            assert_eq!(second, Decision::Admitted);
        }
    }

    #[tokio::test]
    async fn test_different_subjects_have_separate_windows() {
        let h = harness(60, 1, AdmissionMode::Atomic);

        assert!(h.limiter.decide("alice", "api1").await.unwrap().is_admitted());
        assert!(!h.limiter.decide("alice", "api1").await.unwrap().is_admitted());
        assert!(h.limiter.decide("carol", "api1").await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn test_entry_at_window_start_is_evicted() {
        for mode in MODES {
            let h = harness(60, 1, mode);

            h.clock.set(10 * SECOND);
            assert!(h.limiter.decide("dave", "api1").await.unwrap().is_admitted());

            // One millisecond short of the window: still counted.
            h.clock.set(70 * SECOND - 1);
            assert_eq!(
                h.limiter.decide("dave", "api1").await.unwrap(),
                Decision::Denied
            );

            // window_start == entry score: evicted before counting.
            h.clock.set(70 * SECOND);
            assert_eq!(
                h.limiter.decide("dave", "api1").await.unwrap(),
                Decision::Admitted,
                "mode {:?}",
                mode
            );
        }
    }

    #[tokio::test]
    async fn test_same_millisecond_requests_are_separate_entries() {
        for mode in MODES {
            let h = harness(60, 3, mode);
            h.clock.set(5 * SECOND);

            for _ in 0..3 {
                assert!(h.limiter.decide("erin", "api1").await.unwrap().is_admitted());
            }
            assert_eq!(h.store.cardinality("rate:erin:api1").await.unwrap(), 3);
            assert_eq!(
                h.limiter.decide("erin", "api1").await.unwrap(),
                Decision::Denied
            );
        }
    }

    #[tokio::test]
    async fn test_denial_does_not_record() {
        for mode in MODES {
            let h = harness(60, 2, mode);

            for _ in 0..5 {
                h.limiter.decide("frank", "api1").await.unwrap();
            }
            assert_eq!(h.store.cardinality("rate:frank:api1").await.unwrap(), 2);
        }
    }

    #[tokio::test]
    async fn test_zero_limit_denies_everything() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(InMemoryWindowStore::new(clock.clone()));
        let quota = QuotaConfig::new(60, 10).with_resource_limit("api3", 0);
        let limiter = RateLimiter::new(store.clone(), quota).with_clock(clock);

        assert_eq!(limiter.decide("gina", "api3").await.unwrap(), Decision::Denied);
        assert_eq!(limiter.decide("gina", "api1").await.unwrap(), Decision::Admitted);
        assert_eq!(store.key_count(), 1);
    }

    #[tokio::test]
    async fn test_replay_is_deterministic() {
        let calls: Vec<(&str, &str, i64)> = vec![
            ("alice", "api1", 0),
            ("alice", "api1", 100),
            ("bob", "api1", 100),
            ("alice", "api1", 200),
            ("alice", "api2", 300),
            ("alice", "api1", 30_000),
            ("alice", "api1", 60_100),
            ("alice", "api1", 60_150),
            ("bob", "api1", 60_200),
        ];

        for mode in MODES {
            let mut runs = Vec::new();
            for _ in 0..2 {
                let h = harness(60, 2, mode);
                let mut outcomes = Vec::new();
                for (subject, resource, now) in &calls {
                    outcomes.push(h.limiter.decide_at(subject, resource, *now).await.unwrap());
                }
                runs.push(outcomes);
            }
            assert_eq!(runs[0], runs[1]);
            assert_eq!(
                runs[0],
                vec![
                    Decision::Admitted,
                    Decision::Admitted,
                    Decision::Admitted,
                    Decision::Denied,
                    Decision::Admitted,
                    Decision::Denied,
                    Decision::Admitted,
                    Decision::Admitted,
                    Decision::Admitted,
                ]
            );
        }
    }

    #[tokio::test]
    async fn test_admission_refreshes_expiry() {
        for mode in MODES {
            let h = harness(60, 5, mode);
            h.limiter.decide("hank", "api1").await.unwrap();
            assert_eq!(h.store.key_count(), 1);

            // Expiry is window + 1 seconds after the last admission.
            h.clock.advance(61 * SECOND - 1);
            assert_eq!(h.store.purge_expired(), 0);
            h.clock.advance(1);
            assert_eq!(h.store.purge_expired(), 1);
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_not_a_denial() {
        for mode in MODES {
            let sink = Arc::new(RecordingSink::default());
            let (publisher, handle) = UsageEventPublisher::spawn(sink.clone(), 8, 1);
            let limiter = RateLimiter::new(
                Arc::new(UnreachableStore),
                QuotaConfig::new(60, 3).with_mode(mode),
            )
            .with_publisher(publisher);

            let result = limiter.decide("ivan", "api1").await;
            assert!(matches!(result, Err(TrafficGateError::StoreUnavailable(_))));

            drop(limiter);
            handle.join().await;
            assert!(sink.events().is_empty());
        }
    }

    /// Delegates to an in-memory store but cannot set expiries.
    struct NoExpiryStore {
        inner: InMemoryWindowStore,
    }

    #[async_trait]
    impl WindowStore for NoExpiryStore {
        async fn remove_range_by_score(
            &self,
            key: &str,
            min: i64,
            max: i64,
        ) -> std::result::Result<u64, StoreError> {
            self.inner.remove_range_by_score(key, min, max).await
        }

        async fn cardinality(&self, key: &str) -> std::result::Result<u64, StoreError> {
            self.inner.cardinality(key).await
        }

        async fn add_member(
            &self,
            key: &str,
            member: &str,
            score: i64,
        ) -> std::result::Result<(), StoreError> {
            self.inner.add_member(key, member, score).await
        }

        async fn set_expiry(&self, _: &str, _: u64) -> std::result::Result<(), StoreError> {
            Err(StoreError::Unavailable("EXPIRE rejected".to_string()))
        }

        async fn admit_atomic(
            &self,
            key: &str,
            check: &WindowCheck,
        ) -> std::result::Result<AtomicAdmission, StoreError> {
            self.inner.admit_atomic(key, check).await
        }
    }

    #[tokio::test]
    async fn test_sequential_expiry_failure_keeps_entry() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(NoExpiryStore {
            inner: InMemoryWindowStore::new(clock.clone()),
        });
        let sink = Arc::new(RecordingSink::default());
        let (publisher, handle) = UsageEventPublisher::spawn(sink.clone(), 8, 1);
        let limiter = RateLimiter::new(
            store.clone(),
            QuotaConfig::new(60, 1).with_mode(AdmissionMode::Sequential),
        )
        .with_clock(clock)
        .with_publisher(publisher);

        let result = limiter.decide("mia", "api1").await;
        assert!(matches!(result, Err(TrafficGateError::StoreUnavailable(_))));

        // The half-written entry still consumes the only slot.
        assert_eq!(store.cardinality("rate:mia:api1").await.unwrap(), 1);
        assert_eq!(limiter.decide("mia", "api1").await.unwrap(), Decision::Denied);

        drop(limiter);
        handle.join().await;
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_admissions_are_published() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(InMemoryWindowStore::new(clock.clone()));
        let sink = Arc::new(RecordingSink::default());
        let (publisher, handle) = UsageEventPublisher::spawn(sink.clone(), 8, 2);
        let limiter = RateLimiter::new(store, QuotaConfig::new(60, 1))
            .with_clock(clock)
            .with_publisher(publisher);

        assert!(limiter.decide("judy", "api1").await.unwrap().is_admitted());
        assert!(!limiter.decide("judy", "api1").await.unwrap().is_admitted());

        drop(limiter);
        handle.join().await;

        assert_eq!(sink.events(), vec![UsageEvent::new("judy", "api1", 1_000)]);
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_change_decision() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(InMemoryWindowStore::new(clock.clone()));
        let (publisher, handle) = UsageEventPublisher::spawn(Arc::new(FailingSink), 8, 1);
        let stats = handle.stats();
        let limiter = RateLimiter::new(store, QuotaConfig::new(60, 2))
            .with_clock(clock)
            .with_publisher(publisher);

        assert!(limiter.decide("kim", "api1").await.unwrap().is_admitted());
        assert!(limiter.decide("kim", "api1").await.unwrap().is_admitted());
        assert!(!limiter.decide("kim", "api1").await.unwrap().is_admitted());

        drop(limiter);
        handle.join().await;
        assert_eq!(stats.failed(), 2);
    }

    #[tokio::test]
    async fn test_admission_backend_delegates() {
        let h = harness(60, 1, AdmissionMode::Atomic);
        let backend: &dyn AdmissionBackend = &h.limiter;

        assert_eq!(backend.decide("leo", "api1").await.unwrap(), Decision::Admitted);
        assert_eq!(backend.decide("leo", "api1").await.unwrap(), Decision::Denied);
    }
}
