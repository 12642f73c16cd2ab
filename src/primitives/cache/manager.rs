use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::buffer::PageBuffer;
use super::free_pool::FreePool;
use super::options::MemoryCacheConfig;

/// Returns true once a buffer freed at `timestamp_free` has idled for `max_idle_time`.
///
/// A buffer without a timestamp counts as freed at `now`.
pub fn should_reclaim(
    now: Instant,
    timestamp_free: Option<Instant>,
    max_idle_time: Duration,
) -> bool {
    let freed_at = timestamp_free.unwrap_or(now);
    now.saturating_duration_since(freed_at) >= max_idle_time
}

/// Why a cleanup call did or did not sweep the pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CleanupOutcome {
    /// The pool was swept.
    Ran,
    /// Nothing was pooled.
    EmptyPool,
    /// The interval has not elapsed and the pool is within `max_free_pages`.
    Throttled,
    /// Another pass was already running.
    Busy,
}

/// Result of one [`PageBufferManager::cleanup`] call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CleanupStats {
    /// What the call did.
    pub outcome: CleanupOutcome,
    /// Buffers dequeued and examined.
    pub inspected: usize,
    /// Buffers cleared and dropped.
    pub reclaimed: usize,
    /// Buffers examined and put back.
    pub retained: usize,
    /// Pool size after the call.
    pub pool_len: usize,
}

impl CleanupStats {
    fn skipped(outcome: CleanupOutcome, pool_len: usize) -> Self {
        Self {
            outcome,
            inspected: 0,
            reclaimed: 0,
            retained: 0,
            pool_len,
        }
    }
}

/// Cumulative cleanup counters.
#[derive(Default, Clone, Copy, Debug)]
pub struct CleanupTotals {
    /// Passes that actually swept.
    pub passes: u64,
    /// Buffers inspected across all passes.
    pub inspected: u64,
    /// Buffers reclaimed across all passes.
    pub reclaimed: u64,
}

/// Reclaims buffers that have idled in the free pool past `max_idle_time`.
///
/// Each pass inspects at most `batch_size` buffers. Passes never overlap; a call
/// made while one is running returns [`CleanupOutcome::Busy`].
pub struct PageBufferManager {
    config: MemoryCacheConfig,
    pool: Arc<FreePool>,
    running: AtomicBool,
    last_run: Mutex<Option<Instant>>,
    next_bucket: AtomicUsize,
    passes: AtomicU64,
    inspected: AtomicU64,
    reclaimed: AtomicU64,
}

impl PageBufferManager {
    /// Creates a manager sweeping `pool`.
    pub fn new(config: MemoryCacheConfig, pool: Arc<FreePool>) -> Self {
        Self {
            config,
            pool,
            running: AtomicBool::new(false),
            last_run: Mutex::new(None),
            next_bucket: AtomicUsize::new(0),
            passes: AtomicU64::new(0),
            inspected: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
        }
    }

    /// The cleanup settings in force.
    pub fn config(&self) -> &MemoryCacheConfig {
        &self.config
    }

    /// When the last sweeping pass started.
    pub fn last_run(&self) -> Option<Instant> {
        *self.last_run.lock()
    }

    /// Cumulative counters across all passes.
    pub fn totals(&self) -> CleanupTotals {
        CleanupTotals {
            passes: self.passes.load(Ordering::Relaxed),
            inspected: self.inspected.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }

    /// Runs a cleanup pass against the current time.
    pub fn cleanup(&self) -> CleanupStats {
        self.cleanup_at(Instant::now())
    }

    /// Runs a cleanup pass as if the current time were `now`.
    pub fn cleanup_at(&self, now: Instant) -> CleanupStats {
        if self.pool.is_empty() {
            return CleanupStats::skipped(CleanupOutcome::EmptyPool, 0);
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return CleanupStats::skipped(CleanupOutcome::Busy, self.pool.len());
        }
        let stats = self.run_pass(now);
        self.running.store(false, Ordering::Release);
        stats
    }

    fn run_pass(&self, now: Instant) -> CleanupStats {
        {
            let mut last_run = self.last_run.lock();
            let pool_len = self.pool.len();
            let within_interval = last_run
                .map(|last| now.saturating_duration_since(last) < self.config.cleanup_interval)
                .unwrap_or(false);
            if within_interval && pool_len <= self.config.max_free_pages {
                return CleanupStats::skipped(CleanupOutcome::Throttled, pool_len);
            }
            *last_run = Some(now);
        }

        let max_idle_time = self.config.max_idle_time;
        let buckets = self.pool.bucket_count();
        let start = self.next_bucket.fetch_add(1, Ordering::Relaxed);
        let mut budget = self.config.batch_size;
        let mut inspected = 0usize;
        let mut reclaimed = 0usize;
        let mut dirty_drops = 0usize;
        for step in 0..buckets {
            if budget == 0 {
                break;
            }
            let idx = (start + step) % buckets;
            let result = self.pool.sweep_bucket(
                idx,
                budget,
                |buffer| should_reclaim(now, buffer.timestamp_free(), max_idle_time),
                |mut buffer: PageBuffer| {
                    if !buffer.clear() {
                        dirty_drops += 1;
                    }
                },
            );
            budget -= result.inspected;
            inspected += result.inspected;
            reclaimed += result.reclaimed;
        }
        if dirty_drops > 0 {
            warn!(dirty_drops, "cache.cleanup.clear_failed");
        }

        self.passes.fetch_add(1, Ordering::Relaxed);
        self.inspected
            .fetch_add(inspected as u64, Ordering::Relaxed);
        self.reclaimed
            .fetch_add(reclaimed as u64, Ordering::Relaxed);
        let stats = CleanupStats {
            outcome: CleanupOutcome::Ran,
            inspected,
            reclaimed,
            retained: inspected - reclaimed,
            pool_len: self.pool.len(),
        };
        debug!(
            inspected = stats.inspected,
            reclaimed = stats.reclaimed,
            retained = stats.retained,
            pool_len = stats.pool_len,
            "cache.cleanup.pass"
        );
        stats
    }
}

impl std::fmt::Debug for PageBufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBufferManager")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("totals", &self.totals())
            .finish()
    }
}
