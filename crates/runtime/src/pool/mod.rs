//! Size-tiered pool of output-capture buffers.
//!
//! Executions borrow bounded ring buffers from the pool instead of
//! allocating per run. Tiers are derived from the configured min/default/max
//! sizes; an optional maintenance task grows hot tiers and shrinks cold
//! ones based on per-tier usage since the last pass.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::clock::Clock;

pub mod ring;

pub use ring::{RingBuffer, SharedBuffer};

/// Buffer pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Smallest buffer handed out.
    pub min_size: usize,
    /// Size returned by `get()`.
    pub default_size: usize,
    /// Largest pooled size; larger requests get one-off allocations.
    pub max_size: usize,
    /// Free-list target per tier (prewarm fill and grow top-up level).
    pub pool_size: usize,
    /// Populate every tier up front.
    #[serde(default)]
    pub prewarm: bool,
    /// Run the periodic grow/shrink pass.
    #[serde(default)]
    pub adaptive: bool,
    /// Interval between maintenance passes.
    #[serde(with = "humantime_serde", default = "default_check_interval")]
    pub check_interval: Duration,
    /// Tiers used fewer times than this since the last pass shrink.
    pub shrink_threshold: u64,
    /// Tiers used at least this many times since the last pass grow.
    pub grow_threshold: u64,
}

fn default_check_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1024,
            default_size: 64 * 1024,
            max_size: 1024 * 1024,
            pool_size: 4,
            prewarm: false,
            adaptive: false,
            check_interval: default_check_interval(),
            shrink_threshold: 2,
            grow_threshold: 64,
        }
    }
}

impl PoolConfig {
    /// Standard tier sizes: {min, default, 2x, 4x, 8x default, max/4,
    /// max/2, max}, clamped to [min, max], sorted, deduplicated.
    pub fn tiers(&self) -> Vec<usize> {
        let mut sizes = vec![
            self.min_size,
            self.default_size,
            self.default_size * 2,
            self.default_size * 4,
            self.default_size * 8,
            self.max_size / 4,
            self.max_size / 2,
            self.max_size,
        ];
        sizes.retain(|s| *s >= self.min_size && *s <= self.max_size);
        sizes.sort_unstable();
        sizes.dedup();
        sizes
    }
}

#[derive(Default)]
struct PoolCounters {
    gets: AtomicU64,
    puts: AtomicU64,
    misses: AtomicU64,
    custom_allocations: AtomicU64,
    grows: AtomicU64,
    shrinks: AtomicU64,
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub gets: u64,
    pub puts: u64,
    pub misses: u64,
    pub custom_allocations: u64,
    pub grows: u64,
    pub shrinks: u64,
    /// `(gets - misses) / gets * 100`, or 0 when no gets happened yet.
    pub hit_rate: f64,
    pub tiers: Vec<usize>,
    /// Free buffers currently parked, per tier.
    pub free: BTreeMap<usize, usize>,
}

impl PoolStats {
    /// Flat map form for the metrics recorder surface.
    pub fn to_map(&self) -> BTreeMap<String, serde_json::Value> {
        let mut map = BTreeMap::new();
        map.insert("gets".into(), self.gets.into());
        map.insert("puts".into(), self.puts.into());
        map.insert("misses".into(), self.misses.into());
        map.insert("custom_allocations".into(), self.custom_allocations.into());
        map.insert("grows".into(), self.grows.into());
        map.insert("shrinks".into(), self.shrinks.into());
        map.insert(
            "hit_rate".into(),
            serde_json::Number::from_f64(self.hit_rate)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
        );
        map.insert(
            "tiers".into(),
            serde_json::Value::Array(self.tiers.iter().map(|t| (*t).into()).collect()),
        );
        map
    }
}

/// Size-tiered buffer pool.
pub struct BufferPool {
    config: PoolConfig,
    tiers: Vec<usize>,
    free: HashMap<usize, Mutex<Vec<RingBuffer>>>,
    counters: PoolCounters,
    usage: Mutex<HashMap<usize, u64>>,
    shutdown: Notify,
    maintenance_running: AtomicBool,
}

impl BufferPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let tiers = config.tiers();
        let mut free = HashMap::new();
        for tier in &tiers {
            free.insert(*tier, Mutex::new(Vec::new()));
        }

        let pool = Arc::new(Self {
            tiers,
            free,
            counters: PoolCounters::default(),
            usage: Mutex::new(HashMap::new()),
            shutdown: Notify::new(),
            maintenance_running: AtomicBool::new(false),
            config,
        });

        if pool.config.prewarm {
            for tier in pool.tiers.clone() {
                let mut list = pool.free[&tier].lock();
                for _ in 0..pool.config.pool_size {
                    list.push(RingBuffer::with_capacity(tier));
                }
                pool.counters
                    .grows
                    .fetch_add(pool.config.pool_size as u64, Ordering::Relaxed);
            }
        }

        pool
    }

    /// Start the adaptive maintenance loop. No-op unless `adaptive` is set;
    /// safe to call at most once per pool.
    pub fn start_maintenance(self: &Arc<Self>, clock: Arc<dyn Clock>) {
        if !self.config.adaptive {
            return;
        }
        if self.maintenance_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = clock.sleep(pool.config.check_interval) => {
                        if !pool.maintenance_running.load(Ordering::SeqCst) {
                            break;
                        }
                        pool.maintenance_pass();
                    }
                    _ = pool.shutdown.notified() => {
                        break;
                    }
                }
            }
        });
    }

    /// Stop the maintenance loop, if one was started.
    pub fn stop_maintenance(&self) {
        self.shutdown.notify_waiters();
        self.maintenance_running.store(false, Ordering::SeqCst);
    }

    /// A default-sized buffer.
    pub fn get(&self) -> RingBuffer {
        self.get_sized(self.config.default_size)
    }

    /// A buffer from the smallest tier that fits `size`. Requests below the
    /// minimum use the minimum tier; requests above the maximum get a
    /// one-off allocation that will not be pooled on return.
    pub fn get_sized(&self, size: usize) -> RingBuffer {
        self.counters.gets.fetch_add(1, Ordering::Relaxed);

        if size > self.config.max_size {
            self.counters
                .custom_allocations
                .fetch_add(1, Ordering::Relaxed);
            return RingBuffer::with_capacity(size);
        }

        let wanted = size.max(self.config.min_size);
        let tier = *self
            .tiers
            .iter()
            .find(|t| **t >= wanted)
            .unwrap_or(&self.config.max_size);

        *self.usage.lock().entry(tier).or_insert(0) += 1;

        if let Some(buffer) = self.free[&tier].lock().pop() {
            return buffer;
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        RingBuffer::with_capacity(tier)
    }

    /// Return a buffer. `None` is a no-op; buffers whose capacity is not a
    /// standard tier are discarded.
    pub fn put(&self, buffer: Option<RingBuffer>) {
        let Some(mut buffer) = buffer else {
            return;
        };
        self.counters.puts.fetch_add(1, Ordering::Relaxed);

        let capacity = buffer.capacity();
        let Some(list) = self.free.get(&capacity) else {
            return;
        };

        buffer.clear();
        let mut list = list.lock();
        if list.len() < self.config.pool_size.max(1) * 4 {
            list.push(buffer);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let gets = self.counters.gets.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let hit_rate = if gets == 0 {
            0.0
        } else {
            (gets - misses) as f64 / gets as f64 * 100.0
        };

        let mut free = BTreeMap::new();
        for tier in &self.tiers {
            free.insert(*tier, self.free[tier].lock().len());
        }

        PoolStats {
            gets,
            puts: self.counters.puts.load(Ordering::Relaxed),
            misses,
            custom_allocations: self.counters.custom_allocations.load(Ordering::Relaxed),
            grows: self.counters.grows.load(Ordering::Relaxed),
            shrinks: self.counters.shrinks.load(Ordering::Relaxed),
            hit_rate,
            tiers: self.tiers.clone(),
            free,
        }
    }

    /// One grow/shrink pass over the usage map gathered since the last one.
    fn maintenance_pass(&self) {
        let usage: HashMap<usize, u64> = std::mem::take(&mut *self.usage.lock());

        for tier in &self.tiers {
            let used = usage.get(tier).copied().unwrap_or(0);
            let mut list = self.free[tier].lock();

            if used >= self.config.grow_threshold {
                let target = self.config.pool_size;
                while list.len() < target {
                    list.push(RingBuffer::with_capacity(*tier));
                    self.counters.grows.fetch_add(1, Ordering::Relaxed);
                }
            } else if used < self.config.shrink_threshold && !list.is_empty() {
                let drop_count = list.len().div_ceil(2);
                for _ in 0..drop_count {
                    list.pop();
                    self.counters.shrinks.fetch_add(1, Ordering::Relaxed);
                }
                tracing::debug!(tier, used, dropped = drop_count, "shrank buffer tier");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn small_config() -> PoolConfig {
        PoolConfig {
            min_size: 16,
            default_size: 64,
            max_size: 1024,
            pool_size: 2,
            ..PoolConfig::default()
        }
    }

    #[test]
    fn tiers_are_sorted_and_deduplicated() {
        let tiers = small_config().tiers();
        assert_eq!(tiers, vec![16, 64, 128, 256, 512, 1024]);
        for pair in tiers.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn get_returns_default_tier() {
        let pool = BufferPool::new(small_config());
        assert_eq!(pool.get().capacity(), 64);
    }

    #[test]
    fn get_sized_selects_smallest_fitting_tier() {
        let pool = BufferPool::new(small_config());
        assert_eq!(pool.get_sized(1).capacity(), 16);
        assert_eq!(pool.get_sized(65).capacity(), 128);
        assert_eq!(pool.get_sized(512).capacity(), 512);
        assert_eq!(pool.get_sized(1024).capacity(), 1024);
    }

    #[test]
    fn oversized_request_is_a_custom_allocation() {
        let pool = BufferPool::new(small_config());
        let buffer = pool.get_sized(4096);
        assert_eq!(buffer.capacity(), 4096);
        let stats = pool.stats();
        assert_eq!(stats.custom_allocations, 1);
        assert_eq!(stats.gets, 1);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn roundtrip_put_then_get_hits_without_a_miss() {
        let pool = BufferPool::new(small_config());
        let buffer = pool.get_sized(64);
        let misses_before = pool.stats().misses;

        pool.put(Some(buffer));
        let again = pool.get_sized(64);
        assert_eq!(again.capacity(), 64);
        assert_eq!(pool.stats().misses, misses_before);
    }

    #[test]
    fn gets_equals_hits_plus_misses_plus_custom() {
        let pool = BufferPool::new(small_config());
        let a = pool.get_sized(64); // miss
        pool.put(Some(a));
        let _b = pool.get_sized(64); // hit
        let _c = pool.get_sized(4096); // custom
        let _d = pool.get_sized(100); // miss (128 tier, empty)

        let stats = pool.stats();
        let hits = stats.gets - stats.misses - stats.custom_allocations;
        assert_eq!(stats.gets, 4);
        assert_eq!(hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.custom_allocations, 1);
    }

    #[test]
    fn put_none_is_a_noop() {
        let pool = BufferPool::new(small_config());
        pool.put(None);
        assert_eq!(pool.stats().puts, 0);
    }

    #[test]
    fn put_of_non_tier_capacity_is_discarded() {
        let pool = BufferPool::new(small_config());
        pool.put(Some(RingBuffer::with_capacity(100)));
        let stats = pool.stats();
        assert_eq!(stats.puts, 1);
        assert_eq!(stats.free.values().sum::<usize>(), 0);
    }

    #[test]
    fn put_clears_contents_before_pooling() {
        let pool = BufferPool::new(small_config());
        let mut buffer = pool.get_sized(64);
        buffer.push(b"leftover");
        pool.put(Some(buffer));
        assert!(pool.get_sized(64).is_empty());
    }

    #[test]
    fn prewarm_fills_every_tier() {
        let config = PoolConfig {
            prewarm: true,
            ..small_config()
        };
        let pool = BufferPool::new(config);
        let stats = pool.stats();
        for tier in &stats.tiers {
            assert_eq!(stats.free[tier], 2);
        }
        assert_eq!(stats.grows, 2 * stats.tiers.len() as u64);
    }

    #[tokio::test]
    async fn maintenance_shrinks_cold_tiers_and_resets_usage() {
        let config = PoolConfig {
            prewarm: true,
            shrink_threshold: 2,
            grow_threshold: 1000,
            ..small_config()
        };
        let pool = BufferPool::new(config);
        assert_eq!(pool.stats().free[&64], 2);

        pool.maintenance_pass();
        assert_eq!(pool.stats().free[&64], 1);
        assert!(pool.stats().shrinks > 0);
    }

    #[tokio::test]
    async fn maintenance_grows_hot_tiers() {
        let config = PoolConfig {
            grow_threshold: 3,
            shrink_threshold: 0,
            ..small_config()
        };
        let pool = BufferPool::new(config);
        for _ in 0..3 {
            let b = pool.get_sized(64);
            drop(b);
        }

        pool.maintenance_pass();
        assert_eq!(pool.stats().free[&64], 2);
        assert!(pool.stats().grows >= 2);
    }

    #[tokio::test]
    async fn adaptive_loop_runs_on_clock_ticks() {
        let clock = Arc::new(ManualClock::default_epoch());
        let config = PoolConfig {
            prewarm: true,
            adaptive: true,
            shrink_threshold: 2,
            grow_threshold: 1000,
            check_interval: Duration::from_secs(60),
            ..small_config()
        };
        let pool = BufferPool::new(config);
        pool.start_maintenance(clock.clone() as Arc<dyn Clock>);
        tokio::task::yield_now().await;

        clock.advance(Duration::from_secs(61));
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        assert!(pool.stats().shrinks > 0);
        pool.stop_maintenance();
    }

    #[test]
    fn hit_rate_is_zero_with_no_gets() {
        let pool = BufferPool::new(small_config());
        assert_eq!(pool.stats().hit_rate, 0.0);
    }

    #[test]
    fn stats_map_carries_counters() {
        let pool = BufferPool::new(small_config());
        let _ = pool.get();
        let map = pool.stats().to_map();
        assert_eq!(map["gets"], serde_json::json!(1));
        assert!(map.contains_key("hit_rate"));
        assert!(map.contains_key("tiers"));
    }
}
