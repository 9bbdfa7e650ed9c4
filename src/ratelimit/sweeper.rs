//! Periodic eviction of expired counts.
//!
//! Records trim themselves on every increment, but keys that stop receiving
//! traffic would otherwise live forever. The sweeper bounds key cardinality
//! by sweeping the store against the current time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::store::CounterStore;

/// Source of the current epoch second.
pub trait Clock: Send + Sync + 'static {
    fn now_epoch_seconds(&self) -> u64;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
    }
}

/// A clock that only moves when told to.
///
/// Used when time comes from the requests themselves, e.g. when replaying a
/// trace, and in tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    /// Set the current time.
    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move the clock forward to `now`; earlier times are ignored.
    pub fn advance_to(&self, now: u64) {
        self.now.fetch_max(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch_seconds(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Background task that sweeps a counter store at a fixed interval.
pub struct Sweeper;

impl Sweeper {
    /// Spawn the sweep loop on the current tokio runtime.
    ///
    /// The first sweep runs one `interval` after spawning.
    pub fn spawn<S, C>(store: Arc<S>, clock: Arc<C>, interval: Duration) -> SweeperHandle
    where
        S: CounterStore + 'static,
        C: Clock,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        info!(interval_secs = interval.as_secs_f64(), "Starting counter sweeper");

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            let mut total_removed = 0usize;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = clock.now_epoch_seconds();
                        let removed = store.sweep(now);
                        total_removed += removed;
                        debug!(now, removed, records = store.len(), "Sweep completed");
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!(total_removed, "Counter sweeper stopped");
            total_removed
        });

        SweeperHandle { shutdown_tx, task }
    }
}

/// Handle to a running sweeper.
pub struct SweeperHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<usize>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for it to finish.
    ///
    /// Returns the total number of records it removed.
    pub async fn shutdown(self) -> usize {
        let _ = self.shutdown_tx.send(true);
        self.task.await.unwrap_or(0)
    }
}
