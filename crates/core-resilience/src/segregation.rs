//! Slow-query segregation: fast/slow lane admission over a shared pool
//!
//! The segregator partitions a pool's slots into two lanes so that a burst
//! of slow queries cannot occupy every slot and starve cheap ones:
//! - **Fast lane**: `total - slow` slots, short acquisition timeout
//! - **Slow lane**: `floor(total * slow_pct / 100)` slots, long timeout,
//!   bounded wait queue
//!
//! Routing uses the rolling global average execution time μ: a query whose
//! previous run for the same fingerprint was classified slow, or whose
//! estimated cost exceeds `μ * slow_factor`, goes to the slow lane.
//! Completed calls feed their duration into sharded atomic accumulators;
//! μ is recomputed at most once per `update_interval`, so the hot path
//! never takes the global-average lock.

use super::error::ResilienceError;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Number of accumulator shards; writes spread across them to avoid a
/// single contended cache line.
const AVG_SHARDS: usize = 8;

/// Configuration for slow-query segregation
#[derive(Debug, Clone)]
pub struct SegregationConfig {
    /// Total slots available across both lanes
    pub total_slots: usize,
    /// Percentage of slots reserved for the slow lane (0-100)
    pub slow_slot_percentage: u8,
    /// Acquisition timeout for the fast lane
    pub fast_slot_timeout: Duration,
    /// Acquisition timeout for the slow lane
    pub slow_slot_timeout: Duration,
    /// A slot held longer than this past its lane timeout is reported leaked
    pub idle_timeout: Duration,
    /// Interval between recomputations of the global average
    pub update_interval: Duration,
    /// A query is slow when its duration exceeds `avg * slow_factor`
    pub slow_factor: f64,
    /// Maximum callers allowed to wait for a slow slot
    pub max_slow_queue: usize,
    /// Capacity of the fingerprint classification cache
    pub fingerprint_cache_size: usize,
}

impl Default for SegregationConfig {
    fn default() -> Self {
        Self {
            total_slots: 10,
            slow_slot_percentage: 20,
            fast_slot_timeout: Duration::from_secs(60),
            slow_slot_timeout: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(10),
            update_interval: Duration::from_secs(300),
            slow_factor: 2.0,
            max_slow_queue: 64,
            fingerprint_cache_size: 1024,
        }
    }
}

/// Which lane admitted a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Fast,
    Slow,
}

/// A held execution slot. Dropping the permit releases the slot, so every
/// exit path (success, error, cancellation) frees capacity.
pub struct SlotPermit {
    lane: Lane,
    acquired_at: Instant,
    lane_timeout: Duration,
    idle_timeout: Duration,
    _permit: OwnedSemaphorePermit,
}

impl SlotPermit {
    /// Lane that admitted this call
    pub fn lane(&self) -> Lane {
        self.lane
    }

    /// Time since the slot was acquired
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        let held = self.acquired_at.elapsed();
        if held > self.lane_timeout + self.idle_timeout {
            warn!(
                lane = ?self.lane,
                held_ms = held.as_millis() as u64,
                "slot held well past its lane timeout"
            );
        }
    }
}

/// One shard of the duration accumulator
#[derive(Debug, Default)]
struct AvgShard {
    count: AtomicU64,
    sum_micros: AtomicU64,
}

/// Fast/slow lane admission controller for one pool.
pub struct QuerySegregator {
    config: SegregationConfig,
    fast: Arc<Semaphore>,
    slow: Arc<Semaphore>,
    fast_slots: usize,
    slow_slots: usize,
    shards: Vec<AvgShard>,
    next_shard: AtomicUsize,
    /// Current global average in microseconds; zero until first recompute
    global_avg_micros: AtomicU64,
    last_recompute: Mutex<Instant>,
    slow_cache: Mutex<LruCache<u64, bool>>,
    slow_waiting: AtomicUsize,
}

impl QuerySegregator {
    pub fn new(config: SegregationConfig) -> Self {
        let total = config.total_slots.max(1);
        let slow_slots = total * usize::from(config.slow_slot_percentage.min(100)) / 100;
        // The fast lane always keeps at least one slot.
        let slow_slots = slow_slots.min(total - 1);
        let fast_slots = total - slow_slots;

        let cache_size =
            NonZeroUsize::new(config.fingerprint_cache_size).unwrap_or(NonZeroUsize::MIN);

        Self {
            fast: Arc::new(Semaphore::new(fast_slots)),
            slow: Arc::new(Semaphore::new(slow_slots)),
            fast_slots,
            slow_slots,
            shards: (0..AVG_SHARDS).map(|_| AvgShard::default()).collect(),
            next_shard: AtomicUsize::new(0),
            global_avg_micros: AtomicU64::new(0),
            last_recompute: Mutex::new(Instant::now()),
            slow_cache: Mutex::new(LruCache::new(cache_size)),
            slow_waiting: AtomicUsize::new(0),
            config,
        }
    }

    /// Slot counts per lane
    pub fn lane_sizes(&self) -> (usize, usize) {
        (self.fast_slots, self.slow_slots)
    }

    /// Current rolling global average execution time
    pub fn global_average(&self) -> Duration {
        Duration::from_micros(self.global_avg_micros.load(Ordering::Relaxed))
    }

    /// Decide the lane for a fingerprint before execution.
    ///
    /// Slow when the previous execution of the same fingerprint was slow,
    /// or when the caller's estimate exceeds the slow threshold.
    pub fn classify(&self, fingerprint: u64, estimated_cost: Option<Duration>) -> Lane {
        if let Ok(mut cache) = self.slow_cache.lock() {
            if cache.get(&fingerprint).copied().unwrap_or(false) {
                return Lane::Slow;
            }
        }
        if let Some(estimate) = estimated_cost {
            let avg = self.global_avg_micros.load(Ordering::Relaxed);
            if avg > 0 && estimate.as_micros() as u64 > self.slow_threshold_micros(avg) {
                return Lane::Slow;
            }
        }
        Lane::Fast
    }

    /// Acquire an execution slot for a query.
    ///
    /// Fast-lane waits are bounded by `fast_slot_timeout`, slow-lane waits
    /// by `slow_slot_timeout`; a full slow-lane queue is rejected with
    /// [`ResilienceError::Overloaded`] so slow traffic can never pile up
    /// without bound.
    pub async fn acquire(
        &self,
        fingerprint: u64,
        estimated_cost: Option<Duration>,
    ) -> Result<SlotPermit, ResilienceError> {
        match self.classify(fingerprint, estimated_cost) {
            Lane::Fast => self.acquire_lane(Lane::Fast).await,
            Lane::Slow => {
                let waiting = self.slow_waiting.fetch_add(1, Ordering::SeqCst);
                if waiting >= self.config.max_slow_queue {
                    self.slow_waiting.fetch_sub(1, Ordering::SeqCst);
                    return Err(ResilienceError::Overloaded(
                        "slow lane queue full".to_string(),
                    ));
                }
                let result = self.acquire_lane(Lane::Slow).await;
                self.slow_waiting.fetch_sub(1, Ordering::SeqCst);
                result
            }
        }
    }

    async fn acquire_lane(&self, lane: Lane) -> Result<SlotPermit, ResilienceError> {
        let (semaphore, timeout) = match lane {
            Lane::Fast => (self.fast.clone(), self.config.fast_slot_timeout),
            Lane::Slow => (self.slow.clone(), self.config.slow_slot_timeout),
        };
        let permit = match tokio::time::timeout(timeout, semaphore.acquire_owned()).await {
            Err(_) => return Err(ResilienceError::Timeout(timeout)),
            Ok(Err(_)) => {
                return Err(ResilienceError::Overloaded("lane closed".to_string()));
            }
            Ok(Ok(permit)) => permit,
        };
        Ok(SlotPermit {
            lane,
            acquired_at: Instant::now(),
            lane_timeout: timeout,
            idle_timeout: self.config.idle_timeout,
            _permit: permit,
        })
    }

    /// Record a completed execution.
    ///
    /// Feeds the duration into the rolling average and caches the slow/fast
    /// classification for the fingerprint's next admission. The permit is
    /// released by dropping it after this call.
    pub fn record_completion(&self, fingerprint: u64, duration: Duration) {
        let micros = duration.as_micros().min(u128::from(u64::MAX)) as u64;
        let shard = &self.shards[self.next_shard.fetch_add(1, Ordering::Relaxed) % AVG_SHARDS];
        shard.count.fetch_add(1, Ordering::Relaxed);
        shard.sum_micros.fetch_add(micros, Ordering::Relaxed);

        let avg = self.global_avg_micros.load(Ordering::Relaxed);
        if avg > 0 {
            let slow = micros > self.slow_threshold_micros(avg);
            if let Ok(mut cache) = self.slow_cache.lock() {
                cache.put(fingerprint, slow);
            }
            if slow {
                debug!(fingerprint, micros, avg, "query classified slow");
            }
        }

        self.maybe_recompute();
    }

    fn slow_threshold_micros(&self, avg_micros: u64) -> u64 {
        (avg_micros as f64 * self.config.slow_factor) as u64
    }

    /// Recompute μ if the update interval elapsed. Uses `try_lock` so
    /// concurrent completions skip rather than queue behind the lock.
    fn maybe_recompute(&self) {
        let Ok(mut last) = self.last_recompute.try_lock() else {
            return;
        };
        if last.elapsed() < self.config.update_interval {
            return;
        }
        *last = Instant::now();

        let mut count = 0u64;
        let mut sum = 0u64;
        for shard in &self.shards {
            count += shard.count.swap(0, Ordering::Relaxed);
            sum += shard.sum_micros.swap(0, Ordering::Relaxed);
        }
        if count > 0 {
            let avg = sum / count;
            self.global_avg_micros.store(avg, Ordering::Relaxed);
            debug!(avg_micros = avg, samples = count, "global average updated");
        }
    }

    /// Force a recomputation of the rolling average regardless of the
    /// interval. Called by the maintenance tick.
    pub fn recompute_now(&self) {
        if let Ok(mut last) = self.last_recompute.lock() {
            *last = Instant::now();
        }
        let mut count = 0u64;
        let mut sum = 0u64;
        for shard in &self.shards {
            count += shard.count.swap(0, Ordering::Relaxed);
            sum += shard.sum_micros.swap(0, Ordering::Relaxed);
        }
        if count > 0 {
            self.global_avg_micros.store(sum / count, Ordering::Relaxed);
        }
    }

    /// Number of callers currently waiting for a slow slot
    pub fn slow_queue_depth(&self) -> usize {
        self.slow_waiting.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(total: usize, slow_pct: u8) -> SegregationConfig {
        SegregationConfig {
            total_slots: total,
            slow_slot_percentage: slow_pct,
            fast_slot_timeout: Duration::from_millis(100),
            slow_slot_timeout: Duration::from_millis(200),
            update_interval: Duration::from_millis(10),
            max_slow_queue: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_lane_sizing() {
        let seg = QuerySegregator::new(config(10, 20));
        assert_eq!(seg.lane_sizes(), (8, 2));

        let seg = QuerySegregator::new(config(5, 20));
        assert_eq!(seg.lane_sizes(), (4, 1));

        // The fast lane never shrinks to zero.
        let seg = QuerySegregator::new(config(2, 90));
        assert_eq!(seg.lane_sizes(), (1, 1));
    }

    #[tokio::test]
    async fn test_fresh_query_routes_fast() {
        let seg = QuerySegregator::new(config(4, 25));
        let permit = seg.acquire(1, None).await.unwrap();
        assert_eq!(permit.lane(), Lane::Fast);
    }

    #[tokio::test]
    async fn test_slow_fingerprint_routes_slow() {
        let seg = QuerySegregator::new(config(4, 25));

        // Seed the average, then record a slow run for fingerprint 42.
        for _ in 0..4 {
            seg.record_completion(1, Duration::from_millis(10));
        }
        std::thread::sleep(Duration::from_millis(15));
        seg.record_completion(1, Duration::from_millis(10));
        assert!(seg.global_average() > Duration::ZERO);

        seg.record_completion(42, Duration::from_millis(500));

        let permit = seg.acquire(42, None).await.unwrap();
        assert_eq!(permit.lane(), Lane::Slow);
    }

    #[tokio::test]
    async fn test_estimate_above_threshold_routes_slow() {
        let seg = QuerySegregator::new(config(4, 25));
        for _ in 0..4 {
            seg.record_completion(1, Duration::from_millis(10));
        }
        std::thread::sleep(Duration::from_millis(15));
        seg.record_completion(1, Duration::from_millis(10));

        let permit = seg
            .acquire(7, Some(Duration::from_millis(500)))
            .await
            .unwrap();
        assert_eq!(permit.lane(), Lane::Slow);

        let permit = seg
            .acquire(8, Some(Duration::from_millis(5)))
            .await
            .unwrap();
        assert_eq!(permit.lane(), Lane::Fast);
    }

    #[tokio::test]
    async fn test_fast_lane_exhaustion_times_out() {
        let seg = QuerySegregator::new(config(3, 34)); // 2 fast, 1 slow

        let _a = seg.acquire(1, None).await.unwrap();
        let _b = seg.acquire(2, None).await.unwrap();

        let result = seg.acquire(3, None).await;
        assert!(matches!(result, Err(ResilienceError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_slot_released_on_drop() {
        let seg = QuerySegregator::new(config(3, 34));

        let a = seg.acquire(1, None).await.unwrap();
        let _b = seg.acquire(2, None).await.unwrap();
        drop(a);

        assert!(seg.acquire(3, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_slow_queue_overflow_rejected() {
        let seg = Arc::new(QuerySegregator::new(SegregationConfig {
            total_slots: 2,
            slow_slot_percentage: 50, // 1 fast, 1 slow
            slow_slot_timeout: Duration::from_millis(500),
            max_slow_queue: 2,
            update_interval: Duration::from_millis(10),
            ..Default::default()
        }));

        // Mark fingerprint 9 slow via the cache path.
        for _ in 0..4 {
            seg.record_completion(1, Duration::from_millis(10));
        }
        std::thread::sleep(Duration::from_millis(15));
        seg.record_completion(1, Duration::from_millis(10));
        seg.record_completion(9, Duration::from_secs(1));

        // Occupy the single slow slot, then fill the wait queue.
        let _held = seg.acquire(9, None).await.unwrap();
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let seg = seg.clone();
                tokio::spawn(async move { seg.acquire(9, None).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = seg.acquire(9, None).await;
        assert!(matches!(result, Err(ResilienceError::Overloaded(_))));

        for waiter in waiters {
            waiter.abort();
        }
    }

    #[test]
    fn test_average_recompute_replaces_window() {
        let seg = QuerySegregator::new(SegregationConfig {
            update_interval: Duration::from_millis(1),
            ..Default::default()
        });

        seg.record_completion(1, Duration::from_millis(100));
        seg.record_completion(2, Duration::from_millis(200));
        seg.recompute_now();

        let avg = seg.global_average();
        assert!(avg >= Duration::from_millis(140) && avg <= Duration::from_millis(160));
    }
}
