//! Per-key counter records and window arithmetic.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{BurstguardError, Result};

/// Default number of requests per second accepted by the per-second check.
pub const DEFAULT_LIMIT_PER_SECOND: u64 = 10;
/// Default count at which a second becomes a burst second.
pub const DEFAULT_BURST_THRESHOLD_PER_SECOND: u64 = 100;
/// Default number of burst seconds tolerated in the burst window.
pub const DEFAULT_MAX_BURSTS_PER_MINUTE: u64 = 2;

/// How far back the burst window reaches from the evaluated second.
///
/// The window `[t - 60, t]` is inclusive on both ends, i.e. 61 seconds.
pub const BURST_WINDOW_SECS: u64 = 60;

/// The three thresholds a record is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Highest per-second count still accepted by the per-second check
    #[serde(default = "default_limit_per_second")]
    pub limit_per_second: u64,

    /// Count at which a second is considered a burst second
    #[serde(default = "default_burst_threshold_per_second")]
    pub burst_threshold_per_second: u64,

    /// Highest number of burst seconds still accepted within the burst window
    #[serde(default = "default_max_bursts_per_minute")]
    pub max_bursts_per_minute: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            limit_per_second: DEFAULT_LIMIT_PER_SECOND,
            burst_threshold_per_second: DEFAULT_BURST_THRESHOLD_PER_SECOND,
            max_bursts_per_minute: DEFAULT_MAX_BURSTS_PER_MINUTE,
        }
    }
}

fn default_limit_per_second() -> u64 {
    DEFAULT_LIMIT_PER_SECOND
}

fn default_burst_threshold_per_second() -> u64 {
    DEFAULT_BURST_THRESHOLD_PER_SECOND
}

fn default_max_bursts_per_minute() -> u64 {
    DEFAULT_MAX_BURSTS_PER_MINUTE
}

impl Thresholds {
    /// Create a new set of thresholds.
    pub fn new(
        limit_per_second: u64,
        burst_threshold_per_second: u64,
        max_bursts_per_minute: u64,
    ) -> Self {
        Self {
            limit_per_second,
            burst_threshold_per_second,
            max_bursts_per_minute,
        }
    }

    /// Reject thresholds that cannot be enforced.
    ///
    /// A burst threshold of zero would make every second in the window,
    /// including ones without traffic, a burst second.
    pub fn validate(&self) -> Result<()> {
        if self.burst_threshold_per_second == 0 {
            return Err(BurstguardError::InvalidThresholds(
                "burst_threshold_per_second must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of adding one request to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Increment {
    /// The count for the second after the increment
    Counted(u64),
    /// The second is older than the retained window and was dropped
    Stale,
}

/// Per-key state: request counts keyed by epoch second.
///
/// Counts only ever grow. Seconds leave the record only through eviction,
/// once they fall out of the burst window of the newest second seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterRecord {
    thresholds: Thresholds,
    counts: BTreeMap<u64, u64>,
    newest_second: Option<u64>,
}

impl Default for CounterRecord {
    fn default() -> Self {
        Self::new(Thresholds::default())
    }
}

impl CounterRecord {
    /// Create an empty record.
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            counts: BTreeMap::new(),
            newest_second: None,
        }
    }

    /// Get the thresholds this record is evaluated against.
    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Replace the thresholds, keeping all counts.
    pub fn set_thresholds(&mut self, thresholds: Thresholds) {
        self.thresholds = thresholds;
    }

    /// Add exactly one request at `epoch_seconds`, then evict expired seconds.
    pub fn increment(&mut self, epoch_seconds: u64) -> Increment {
        let newest = self
            .newest_second
            .map_or(epoch_seconds, |n| n.max(epoch_seconds));

        if epoch_seconds < window_start(newest) {
            return Increment::Stale;
        }

        let count = self.counts.entry(epoch_seconds).or_insert(0);
        *count += 1;
        let count = *count;

        self.newest_second = Some(newest);
        self.evict_before(window_start(newest));

        Increment::Counted(count)
    }

    /// Get the count recorded for a second (0 when absent).
    pub fn count_at(&self, epoch_seconds: u64) -> u64 {
        self.counts.get(&epoch_seconds).copied().unwrap_or(0)
    }

    /// Count the burst seconds in the window ending at `epoch_seconds`.
    pub fn burst_seconds(&self, epoch_seconds: u64) -> u64 {
        let threshold = self.thresholds.burst_threshold_per_second;
        self.counts
            .range(window_start(epoch_seconds)..=epoch_seconds)
            .filter(|&(_, &count)| count >= threshold)
            .count() as u64
    }

    /// Whether the per-second count is at or below the limit.
    pub fn is_under_per_second_limit(&self, epoch_seconds: u64) -> bool {
        self.count_at(epoch_seconds) <= self.thresholds.limit_per_second
    }

    /// Whether the burst seconds in the window are at or below the budget.
    pub fn is_under_burst_limit(&self, epoch_seconds: u64) -> bool {
        self.burst_seconds(epoch_seconds) <= self.thresholds.max_bursts_per_minute
    }

    /// Drop every second strictly before `cutoff`.
    ///
    /// Returns the number of seconds removed.
    pub fn evict_before(&mut self, cutoff: u64) -> usize {
        let before = self.counts.len();
        self.counts = self.counts.split_off(&cutoff);
        before - self.counts.len()
    }

    /// Get the newest second this record has counted.
    pub fn newest_second(&self) -> Option<u64> {
        self.newest_second
    }

    /// Number of distinct seconds currently held.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Whether the record holds no counts.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// First second of the burst window ending at `epoch_seconds`.
pub fn window_start(epoch_seconds: u64) -> u64 {
    epoch_seconds.saturating_sub(BURST_WINDOW_SECS)
}
