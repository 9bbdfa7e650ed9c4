//! Counter storage.
//!
//! The [`CounterStore`] trait is the seam between the rate limiting policy
//! and wherever counts actually live. [`InMemoryCounterStore`] keeps them in
//! a sharded concurrent map owned by the embedding service.

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, trace};

use super::counter::{window_start, CounterRecord, Increment};
use super::descriptor::RateLimitKey;
use super::rules::ThresholdRules;

/// Trait for counter store implementations.
///
/// Implementations must hand out a single logical record per key and must
/// run [`CounterStore::update`] closures with exclusive access to that record.
pub trait CounterStore: Send + Sync {
    /// Get a snapshot of the record for `key`, creating an empty one if absent.
    fn get_or_create(&self, key: &RateLimitKey) -> CounterRecord;

    /// Add one request for `key` at `epoch_seconds`, creating the record if absent.
    fn increment(&self, key: &RateLimitKey, epoch_seconds: u64) -> Increment;

    /// Run `f` against the record for `key` while holding the key's lock.
    fn update<T, F>(&self, key: &RateLimitKey, f: F) -> T
    where
        F: FnOnce(&mut CounterRecord) -> T;

    /// Drop records whose newest second is older than the burst window
    /// ending at `now`, and trim the rest to their own burst window.
    ///
    /// Returns the number of records removed.
    fn sweep(&self, now: u64) -> usize;

    /// Get the number of records held.
    fn len(&self) -> usize;

    /// Whether the store holds no records.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Counter store backed by a sharded concurrent map.
///
/// Each shard has its own lock, so requests for different keys rarely
/// contend, and all access to one key is serialized.
pub struct InMemoryCounterStore {
    /// Counter records indexed by key
    records: DashMap<RateLimitKey, CounterRecord>,
    /// Thresholds assigned to records on creation
    rules: RwLock<ThresholdRules>,
}

impl InMemoryCounterStore {
    /// Create a store where every key uses the default thresholds.
    pub fn new() -> Self {
        Self::with_rules(ThresholdRules::default())
    }

    /// Create a store that resolves thresholds per key from `rules`.
    pub fn with_rules(rules: ThresholdRules) -> Self {
        Self {
            records: DashMap::new(),
            rules: RwLock::new(rules),
        }
    }

    /// Replace the threshold rules.
    ///
    /// Existing records are re-resolved against the new rules; their counts
    /// are kept.
    pub fn set_rules(&self, rules: ThresholdRules) {
        // New records resolve under their shard lock: inserted after this
        // write they see the new rules, before it they are visited below.
        // Never hold the rules lock while a shard is locked.
        *self.rules.write() = rules.clone();
        for mut entry in self.records.iter_mut() {
            let thresholds = rules.resolve(entry.key());
            entry.value_mut().set_thresholds(thresholds);
        }
        debug!(records = self.records.len(), "Threshold rules replaced");
    }

    /// Get the current threshold rules.
    pub fn rules(&self) -> ThresholdRules {
        self.rules.read().clone()
    }

    /// Clear all records.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.records.clear();
    }

    fn new_record(&self, key: &RateLimitKey) -> CounterRecord {
        let thresholds = self.rules.read().resolve(key);
        debug!(
            key = %key,
            limit_per_second = thresholds.limit_per_second,
            burst_threshold_per_second = thresholds.burst_threshold_per_second,
            max_bursts_per_minute = thresholds.max_bursts_per_minute,
            "Creating new counter record"
        );
        CounterRecord::new(thresholds)
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterStore for InMemoryCounterStore {
    fn get_or_create(&self, key: &RateLimitKey) -> CounterRecord {
        self.update(key, |record| record.clone())
    }

    fn increment(&self, key: &RateLimitKey, epoch_seconds: u64) -> Increment {
        let outcome = self.update(key, |record| record.increment(epoch_seconds));
        if outcome == Increment::Stale {
            trace!(key = %key, epoch_seconds, "Dropped increment older than the burst window");
        }
        outcome
    }

    fn update<T, F>(&self, key: &RateLimitKey, f: F) -> T
    where
        F: FnOnce(&mut CounterRecord) -> T,
    {
        // Fast path: the key already exists, no need to clone it.
        if let Some(mut record) = self.records.get_mut(key) {
            return f(record.value_mut());
        }

        let mut entry = self
            .records
            .entry(key.clone())
            .or_insert_with(|| self.new_record(key));
        f(entry.value_mut())
    }

    fn sweep(&self, now: u64) -> usize {
        let cutoff = window_start(now);
        let before = self.records.len();

        // A record is idle once its newest second has left the window ending
        // at `now`. Records still in use are trimmed against their own newest
        // second, never against `now`.
        self.records.retain(|_, record| match record.newest_second() {
            Some(newest) if newest >= cutoff => {
                record.evict_before(window_start(newest));
                true
            }
            _ => false,
        });

        let removed = before.saturating_sub(self.records.len());
        debug!(now, removed, remaining = self.records.len(), "Swept counter store");
        removed
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}
