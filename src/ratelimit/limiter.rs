//! Core rate limiter implementation.
//!
//! A request is rejected only when it is over the per-second limit *and*
//! the key has spent its burst budget for the trailing minute. Steady load
//! is capped tightly while short spikes are tolerated.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, trace};

use super::counter::{CounterRecord, Increment, Thresholds};
use super::descriptor::{RateLimitKey, RequestDescriptor};
use super::store::{CounterStore, InMemoryCounterStore};
use crate::error::Result;

/// Full outcome of an admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests counted for the key in the request's second
    pub count: u64,
    /// Burst seconds in the window ending at the request's second
    pub burst_seconds: u64,
    /// Whether `count` is at or below the per-second limit
    pub under_per_second_limit: bool,
    /// Whether `burst_seconds` is at or below the burst budget
    pub under_burst_limit: bool,
    /// Thresholds the decision was made against
    pub thresholds: Thresholds,
}

impl Decision {
    fn evaluate(record: &CounterRecord, epoch_seconds: u64) -> Self {
        let under_per_second_limit = record.is_under_per_second_limit(epoch_seconds);
        let under_burst_limit = record.is_under_burst_limit(epoch_seconds);

        Self {
            allowed: under_per_second_limit || under_burst_limit,
            count: record.count_at(epoch_seconds),
            burst_seconds: record.burst_seconds(epoch_seconds),
            under_per_second_limit,
            under_burst_limit,
            thresholds: record.thresholds(),
        }
    }
}

/// Rate limiting policy over a [`CounterStore`].
///
/// The limiter itself holds no counts; the store is owned by the embedding
/// service and shared through an `Arc`.
pub struct RateLimiter<S: CounterStore = InMemoryCounterStore> {
    store: Arc<S>,
}

impl<S: CounterStore> Clone for RateLimiter<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl RateLimiter<InMemoryCounterStore> {
    /// Create a rate limiter over a fresh in-memory store with default thresholds.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryCounterStore::new()))
    }
}

impl<S: CounterStore> RateLimiter<S> {
    /// Create a rate limiter over an existing store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Get the underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Count one occurrence of the request.
    pub fn record_request(&self, req: &RequestDescriptor) {
        let key = req.key();
        match self.store.increment(&key, req.epoch_seconds) {
            Increment::Counted(count) => {
                trace!(key = %key, epoch_seconds = req.epoch_seconds, count, "Recorded request");
            }
            Increment::Stale => {
                debug!(
                    key = %key,
                    epoch_seconds = req.epoch_seconds,
                    "Request is older than the burst window, not recorded"
                );
            }
        }
    }

    /// Whether the count for the request's second is at or below the limit.
    ///
    /// The comparison is inclusive: a count equal to the limit still passes.
    pub fn is_under_per_second_limit(&self, req: &RequestDescriptor) -> bool {
        self.store
            .update(&req.key(), |record| record.is_under_per_second_limit(req.epoch_seconds))
    }

    /// Whether the burst seconds in `[t - 60, t]` are at or below the budget.
    pub fn is_under_burst_limit(&self, req: &RequestDescriptor) -> bool {
        self.store
            .update(&req.key(), |record| record.is_under_burst_limit(req.epoch_seconds))
    }

    /// Whether the request is admitted given the current counts.
    ///
    /// Both checks read one consistent snapshot of the record.
    pub fn is_allowed(&self, req: &RequestDescriptor) -> bool {
        self.evaluate(req).allowed
    }

    /// Evaluate the request against the current counts without recording it.
    pub fn evaluate(&self, req: &RequestDescriptor) -> Decision {
        let key = req.key();
        let decision = self
            .store
            .update(&key, |record| Decision::evaluate(record, req.epoch_seconds));
        log_decision(&key, req.epoch_seconds, &decision);
        decision
    }

    /// Record the request, then decide on it, as one step per key.
    ///
    /// No other request for the same key can be counted between the
    /// increment and the checks, so concurrent callers cannot both observe
    /// a count below the limit.
    ///
    /// A request older than the key's burst window is stale: it is not
    /// counted and is decided on the retained counts, so it is admitted.
    pub fn admit(&self, req: &RequestDescriptor) -> Decision {
        let key = req.key();
        let (increment, decision) = self.store.update(&key, |record| {
            let increment = record.increment(req.epoch_seconds);
            (increment, Decision::evaluate(record, req.epoch_seconds))
        });
        if increment == Increment::Stale {
            debug!(
                key = %key,
                epoch_seconds = req.epoch_seconds,
                "Request is older than the burst window, not recorded"
            );
        }
        log_decision(&key, req.epoch_seconds, &decision);
        decision
    }

    /// Validate and record a request.
    pub fn record(&self, api_key: &str, route: &str, epoch_seconds: i64) -> Result<()> {
        let req = RequestDescriptor::new(api_key, route, epoch_seconds)?;
        self.record_request(&req);
        Ok(())
    }

    /// Validate a request and report whether it is admitted.
    pub fn allowed(&self, api_key: &str, route: &str, epoch_seconds: i64) -> Result<bool> {
        let req = RequestDescriptor::new(api_key, route, epoch_seconds)?;
        Ok(self.is_allowed(&req))
    }

    /// Get a snapshot of the counts for a key.
    pub fn snapshot(&self, key: &RateLimitKey) -> CounterRecord {
        self.store.get_or_create(key)
    }
}

impl Default for RateLimiter<InMemoryCounterStore> {
    fn default() -> Self {
        Self::in_memory()
    }
}

fn log_decision(key: &RateLimitKey, epoch_seconds: u64, decision: &Decision) {
    if decision.allowed {
        trace!(
            key = %key,
            epoch_seconds,
            count = decision.count,
            burst_seconds = decision.burst_seconds,
            "Request allowed"
        );
    } else {
        debug!(
            key = %key,
            epoch_seconds,
            count = decision.count,
            limit_per_second = decision.thresholds.limit_per_second,
            burst_seconds = decision.burst_seconds,
            max_bursts_per_minute = decision.thresholds.max_bursts_per_minute,
            "Rate limit exceeded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BurstguardError;
    use crate::ratelimit::counter::{
        DEFAULT_BURST_THRESHOLD_PER_SECOND, DEFAULT_LIMIT_PER_SECOND,
        DEFAULT_MAX_BURSTS_PER_MINUTE,
    };
    use crate::ratelimit::rules::ThresholdRules;

    const BASE_EPOCH: u64 = 1000;

    fn request(epoch: u64) -> RequestDescriptor {
        RequestDescriptor::new("test_key", "/test", epoch as i64).unwrap()
    }

    fn record_n(limiter: &RateLimiter, epoch: u64, n: u64) {
        let req = request(epoch);
        for _ in 0..n {
            limiter.record_request(&req);
        }
    }

    /// Push the second over the burst threshold.
    fn create_burst(limiter: &RateLimiter, epoch: u64) {
        record_n(limiter, epoch, DEFAULT_BURST_THRESHOLD_PER_SECOND + 1);
    }

    #[test]
    fn test_allowed_when_no_requests() {
        let limiter = RateLimiter::in_memory();
        assert!(limiter.is_allowed(&request(BASE_EPOCH)));
        assert!(limiter.allowed("fresh", "/never/seen", 0).unwrap());
    }

    #[test]
    fn test_per_second_limit_boundary() {
        let limiter = RateLimiter::in_memory();
        let req = request(BASE_EPOCH);

        assert!(limiter.is_under_per_second_limit(&req));

        record_n(&limiter, BASE_EPOCH, DEFAULT_LIMIT_PER_SECOND);
        assert!(limiter.is_under_per_second_limit(&req));

        limiter.record_request(&req);
        assert!(!limiter.is_under_per_second_limit(&req));
    }

    #[test]
    fn test_burst_limit_boundary() {
        let limiter = RateLimiter::in_memory();
        assert!(limiter.is_under_burst_limit(&request(BASE_EPOCH)));

        for n in 0..DEFAULT_MAX_BURSTS_PER_MINUTE {
            create_burst(&limiter, BASE_EPOCH + n);
        }

        let new_epoch = BASE_EPOCH + DEFAULT_MAX_BURSTS_PER_MINUTE + 1;
        assert!(limiter.is_under_burst_limit(&request(new_epoch)));

        create_burst(&limiter, new_epoch);
        assert!(!limiter.is_under_burst_limit(&request(new_epoch)));
    }

    #[test]
    fn test_burst_limit_enforcement() {
        let limiter = RateLimiter::in_memory();

        for n in 0..DEFAULT_MAX_BURSTS_PER_MINUTE {
            create_burst(&limiter, BASE_EPOCH + n);
        }

        // At the burst budget, a new second is still allowed
        let new_epoch = BASE_EPOCH + DEFAULT_MAX_BURSTS_PER_MINUTE;
        assert!(limiter.is_allowed(&request(new_epoch)));

        create_burst(&limiter, new_epoch);
        assert!(!limiter.is_allowed(&request(new_epoch)));
    }

    #[test]
    fn test_burst_window_slides() {
        let limiter = RateLimiter::in_memory();

        for n in 0..=DEFAULT_MAX_BURSTS_PER_MINUTE {
            create_burst(&limiter, BASE_EPOCH + n);
        }
        let last_burst = BASE_EPOCH + DEFAULT_MAX_BURSTS_PER_MINUTE;
        assert!(!limiter.is_allowed(&request(last_burst)));

        // Window for 1061 is [1001, 1061]: the burst at 1000 has left it
        let later = request(BASE_EPOCH + 61);
        assert!(limiter.is_allowed(&later));
        assert_eq!(limiter.evaluate(&later).burst_seconds, DEFAULT_MAX_BURSTS_PER_MINUTE);
    }

    #[test]
    fn test_bursts_older_than_window_are_ignored() {
        let limiter = RateLimiter::in_memory();
        create_burst(&limiter, 1000);
        create_burst(&limiter, 1001);

        let decision = limiter.evaluate(&request(1062));
        assert_eq!(decision.burst_seconds, 0);

        let decision = limiter.evaluate(&request(1061));
        assert_eq!(decision.burst_seconds, 1);

        let decision = limiter.evaluate(&request(1060));
        assert_eq!(decision.burst_seconds, 2);
    }

    #[test]
    fn test_combined_per_second_and_burst_limits() {
        let limiter = RateLimiter::in_memory();

        // Over the per-second limit but within the burst budget
        record_n(&limiter, BASE_EPOCH, DEFAULT_LIMIT_PER_SECOND + 1);
        let decision = limiter.evaluate(&request(BASE_EPOCH));
        assert!(!decision.under_per_second_limit);
        assert!(decision.under_burst_limit);
        assert!(decision.allowed);

        for n in 0..DEFAULT_MAX_BURSTS_PER_MINUTE {
            create_burst(&limiter, BASE_EPOCH + n);
        }
        let new_epoch = BASE_EPOCH + DEFAULT_MAX_BURSTS_PER_MINUTE;
        create_burst(&limiter, new_epoch);

        let decision = limiter.evaluate(&request(new_epoch));
        assert!(!decision.under_per_second_limit);
        assert!(!decision.under_burst_limit);
        assert!(!decision.allowed);
    }

    #[test]
    fn test_over_burst_budget_but_under_per_second_is_allowed() {
        let limiter = RateLimiter::in_memory();
        for n in 0..=DEFAULT_MAX_BURSTS_PER_MINUTE {
            create_burst(&limiter, BASE_EPOCH + n);
        }

        // A quiet second inside the same window
        let quiet = request(BASE_EPOCH + 10);
        assert!(!limiter.is_under_burst_limit(&quiet));
        assert!(limiter.is_allowed(&quiet));
    }

    #[test]
    fn test_record_then_check_vs_check_then_record() {
        let tight = ThresholdRules::new(Thresholds::new(2, 3, 0));

        // Checking before recording sees the count without this request
        let limiter = RateLimiter::new(Arc::new(InMemoryCounterStore::with_rules(tight.clone())));
        let req = request(BASE_EPOCH);
        let mut admitted = 0;
        for _ in 0..5 {
            if limiter.is_allowed(&req) {
                admitted += 1;
            }
            limiter.record_request(&req);
        }
        assert_eq!(admitted, 3);

        // Recording first includes this request in the count
        let limiter = RateLimiter::new(Arc::new(InMemoryCounterStore::with_rules(tight)));
        let mut admitted = 0;
        for _ in 0..5 {
            if limiter.admit(&req).allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 2);
    }

    #[test]
    fn test_admit_reports_counts() {
        let limiter = RateLimiter::in_memory();
        let req = request(BASE_EPOCH);

        let decision = limiter.admit(&req);
        assert!(decision.allowed);
        assert_eq!(decision.count, 1);
        assert_eq!(decision.burst_seconds, 0);
        assert_eq!(decision.thresholds, Thresholds::default());
    }

    #[test]
    fn test_admit_stale_request_is_not_counted() {
        let limiter = RateLimiter::in_memory();
        record_n(&limiter, BASE_EPOCH + 100, 3);
        let before = limiter.snapshot(&request(BASE_EPOCH).key());

        // BASE_EPOCH is older than BASE_EPOCH + 100 - 60
        let decision = limiter.admit(&request(BASE_EPOCH));
        assert!(decision.allowed);
        assert_eq!(decision.count, 0);
        assert_eq!(decision.burst_seconds, 0);

        let after = limiter.snapshot(&request(BASE_EPOCH).key());
        assert_eq!(after, before);
        assert_eq!(after.count_at(BASE_EPOCH), 0);
        assert_eq!(after.count_at(BASE_EPOCH + 100), 3);
    }

    #[test]
    fn test_default_thresholds_admit_a_single_second_forever() {
        // One burst second never exhausts a budget of two
        let limiter = RateLimiter::in_memory();
        let req = request(BASE_EPOCH);
        for _ in 0..500 {
            assert!(limiter.admit(&req).allowed);
        }
    }

    #[test]
    fn test_concurrent_admission_is_atomic() {
        // Per-second limit of 10, every counted second over 10 is a burst,
        // and no bursts are tolerated: exactly 10 requests get through.
        let rules = ThresholdRules::new(Thresholds::new(10, 11, 0));
        let limiter = RateLimiter::new(Arc::new(InMemoryCounterStore::with_rules(rules)));
        let admitted = std::sync::atomic::AtomicU64::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                let limiter = limiter.clone();
                let admitted = &admitted;
                s.spawn(move || {
                    let req = request(BASE_EPOCH);
                    for _ in 0..25 {
                        if limiter.admit(&req).allowed {
                            admitted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.load(std::sync::atomic::Ordering::SeqCst), 10);
        assert_eq!(limiter.snapshot(&request(BASE_EPOCH).key()).count_at(BASE_EPOCH), 200);
    }

    #[test]
    fn test_boundary_rejects_invalid_input() {
        let limiter = RateLimiter::in_memory();

        assert!(matches!(
            limiter.record("", "/test", 1000),
            Err(BurstguardError::EmptyApiKey)
        ));
        assert!(matches!(
            limiter.allowed("key", "", 1000),
            Err(BurstguardError::EmptyRoute)
        ));
        assert!(matches!(
            limiter.allowed("key", "/test", -1),
            Err(BurstguardError::NegativeEpoch(-1))
        ));

        // Nothing was stored for the rejected requests
        assert!(limiter.store().is_empty());
    }

    #[test]
    fn test_boundary_record_and_allowed() {
        let limiter = RateLimiter::in_memory();
        for _ in 0..11 {
            limiter.record("key", "/test", 1000).unwrap();
        }
        // Over the per-second limit, still inside the burst budget
        assert!(limiter.allowed("key", "/test", 1000).unwrap());
        assert_eq!(
            limiter.snapshot(&RateLimitKey::new("key", "/test")).count_at(1000),
            11
        );
    }

    #[test]
    fn test_routes_are_limited_independently() {
        let limiter = RateLimiter::in_memory();
        for _ in 0..11 {
            limiter.record("key", "/a", 1000).unwrap();
        }
        let a = RequestDescriptor::new("key", "/a", 1000).unwrap();
        let b = RequestDescriptor::new("key", "/b", 1000).unwrap();
        assert!(!limiter.is_under_per_second_limit(&a));
        assert!(limiter.is_under_per_second_limit(&b));
    }
}
