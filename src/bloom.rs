//! Per-cache bloom filters guarding against cache penetration.
//!
//! One filter per cache name, created on the first insert from the
//! [`BloomFilterConfigProvider`]. A filter never answers "absent" for a key
//! it holds, but when it fills up to 90% of its expected insertions it is
//! replaced by an empty filter of twice the size. Membership of every key
//! inserted before the resize is lost at that point, so a negative answer is
//! only ever a hint: callers still consult the remote tier.

use crate::config::{BloomFilterConfig, BloomFilterConfigProvider};
use crate::error::{Error, Result};
use crate::observability::{CacheMetrics, NoOpMetrics};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::f64::consts::LN_2;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Fill ratio of expected insertions at which a filter is replaced.
pub const RESIZE_LOAD_FACTOR: f64 = 0.9;

/// Smallest bit array allocated for a filter.
const MIN_BITS: u64 = 64;

/// Fixed-size bloom filter using double hashing.
#[derive(Clone, Debug)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Size a filter for `expected_insertions` at `false_positive_rate`.
    pub fn new(expected_insertions: u64, false_positive_rate: f64) -> Self {
        let num_bits = Self::optimal_num_bits(expected_insertions, false_positive_rate);
        let num_hashes = Self::optimal_num_hashes(expected_insertions, num_bits);
        let words = num_bits.div_ceil(64) as usize;

        BloomFilter {
            bits: vec![0; words],
            num_bits,
            num_hashes,
        }
    }

    /// `m = -n ln p / (ln 2)^2`
    pub fn optimal_num_bits(expected_insertions: u64, false_positive_rate: f64) -> u64 {
        let n = expected_insertions.max(1) as f64;
        let m = (-n * false_positive_rate.ln() / (LN_2 * LN_2)).ceil();
        (m as u64).max(MIN_BITS)
    }

    /// `k = m / n ln 2`, at least one.
    pub fn optimal_num_hashes(expected_insertions: u64, num_bits: u64) -> u32 {
        let n = expected_insertions.max(1) as f64;
        let k = (num_bits as f64 / n * LN_2).round();
        (k as u32).max(1)
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Number of set bits.
    pub fn bit_count(&self) -> u64 {
        self.bits.iter().map(|w| u64::from(w.count_ones())).sum()
    }

    /// Add an item. Returns whether any bit changed.
    pub fn insert(&mut self, item: &[u8]) -> bool {
        let mut changed = false;
        for index in self.indexes(item) {
            let (word, mask) = (index / 64, 1u64 << (index % 64));
            let slot = &mut self.bits[word as usize];
            if *slot & mask == 0 {
                *slot |= mask;
                changed = true;
            }
        }
        changed
    }

    /// `false` only if the item was certainly never inserted.
    pub fn might_contain(&self, item: &[u8]) -> bool {
        self.indexes(item)
            .all(|index| self.bits[(index / 64) as usize] & (1u64 << (index % 64)) != 0)
    }

    fn indexes(&self, item: &[u8]) -> impl Iterator<Item = u64> {
        let (h1, h2) = hash_pair(item);
        let num_bits = self.num_bits;
        (0..u64::from(self.num_hashes))
            .map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % num_bits)
    }
}

fn hash_pair(item: &[u8]) -> (u64, u64) {
    let mut first = DefaultHasher::new();
    item.hash(&mut first);
    let h1 = first.finish();

    let mut second = DefaultHasher::new();
    h1.hash(&mut second);
    item.hash(&mut second);
    // Odd step so every hash sequence covers distinct bits.
    (h1, second.finish() | 1)
}

/// Filter of one cache name with its insertion bookkeeping.
#[derive(Debug)]
pub struct BloomFilterState {
    filter: BloomFilter,
    expected_insertions: u64,
    false_positive_rate: f64,
    current_insertions: u64,
}

impl BloomFilterState {
    fn new(config: &BloomFilterConfig) -> Self {
        BloomFilterState {
            filter: BloomFilter::new(config.expected_insertions, config.false_positive_rate),
            expected_insertions: config.expected_insertions,
            false_positive_rate: config.false_positive_rate,
            current_insertions: 0,
        }
    }

    fn resize_threshold(&self) -> u64 {
        ((self.expected_insertions as f64 * RESIZE_LOAD_FACTOR).floor() as u64).max(1)
    }
}

/// Snapshot of a cache name's filter.
#[derive(Debug, Clone, PartialEq)]
pub struct BloomFilterStats {
    pub expected_insertions: u64,
    pub current_insertions: u64,
    pub false_positive_rate: f64,
    pub num_bits: u64,
    pub num_hashes: u32,
}

/// Owner of every cache name's bloom filter.
///
/// Inserts for one cache name are serialized by a per-name lock so that the
/// threshold check, the resize and the insert happen as one step.
pub struct BloomFilterManager {
    filters: DashMap<String, Arc<Mutex<BloomFilterState>>>,
    config: Arc<dyn BloomFilterConfigProvider>,
    metrics: Arc<dyn CacheMetrics>,
}

impl BloomFilterManager {
    pub fn new(config: Arc<dyn BloomFilterConfigProvider>) -> Self {
        BloomFilterManager {
            filters: DashMap::new(),
            config,
            metrics: Arc::new(NoOpMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Whether the configuration enables a filter for the cache name.
    pub fn is_enabled(&self, cache_name: &str) -> bool {
        self.config.bloom_filter_config(cache_name).enabled
    }

    /// Whether `key` may have been inserted into the cache name's filter.
    ///
    /// Returns `true` while no filter exists for the name.
    pub fn might_contain(&self, cache_name: &str, key: &[u8]) -> bool {
        let state = match self.filters.get(cache_name) {
            Some(state) => Arc::clone(state.value()),
            None => return true,
        };
        let state = state.lock();
        state.filter.might_contain(key)
    }

    /// Insert a key, creating or resizing the filter as needed.
    ///
    /// # Errors
    /// - `Error::IllegalState` if the cache name has its filter disabled
    /// - `Error::ConfigError` if the filter settings are invalid
    pub fn put(&self, cache_name: &str, key: &[u8]) -> Result<()> {
        let state = self.state_for(cache_name)?;
        let mut state = state.lock();

        // An empty filter is never replaced, however small its capacity.
        if state.current_insertions > 0
            && state.current_insertions + 1 >= state.resize_threshold()
        {
            let old_insertions = state.current_insertions;
            let old_expected = state.expected_insertions;
            let new_expected = old_expected.saturating_mul(2);

            state.filter = BloomFilter::new(new_expected, state.false_positive_rate);
            state.expected_insertions = new_expected;
            state.current_insertions = 0;

            warn!(
                "⚠ Bloom filter for {} resized {} -> {} expected insertions, membership of {} keys dropped",
                cache_name, old_expected, new_expected, old_insertions
            );
            self.metrics
                .record_bloom_resize(cache_name, old_insertions, old_expected, new_expected);
        }

        state.filter.insert(key);
        state.current_insertions += 1;
        Ok(())
    }

    /// Insert a key on a background task.
    pub fn put_async(self: &Arc<Self>, cache_name: &str, key: Vec<u8>) -> JoinHandle<Result<()>> {
        let manager = Arc::clone(self);
        let cache_name = cache_name.to_string();
        tokio::spawn(async move {
            let result = manager.put(&cache_name, &key);
            if let Err(e) = &result {
                warn!("Bloom filter insert for {} failed: {}", cache_name, e);
            }
            result
        })
    }

    pub fn stats(&self, cache_name: &str) -> Option<BloomFilterStats> {
        let state = Arc::clone(self.filters.get(cache_name)?.value());
        let state = state.lock();
        Some(BloomFilterStats {
            expected_insertions: state.expected_insertions,
            current_insertions: state.current_insertions,
            false_positive_rate: state.false_positive_rate,
            num_bits: state.filter.num_bits(),
            num_hashes: state.filter.num_hashes(),
        })
    }

    /// Drop the filter of a cache name; reads fail open until the next insert.
    pub fn remove(&self, cache_name: &str) -> bool {
        self.filters.remove(cache_name).is_some()
    }

    fn state_for(&self, cache_name: &str) -> Result<Arc<Mutex<BloomFilterState>>> {
        let config = self.config.bloom_filter_config(cache_name);
        if !config.enabled {
            return Err(Error::IllegalState(format!(
                "Bloom filter is not enabled for cache '{}'",
                cache_name
            )));
        }

        if let Some(state) = self.filters.get(cache_name) {
            return Ok(Arc::clone(state.value()));
        }

        config.validate()?;
        let state = self
            .filters
            .entry(cache_name.to_string())
            .or_insert_with(|| {
                info!(
                    "✓ Bloom filter created for {} ({} expected, fpp {})",
                    cache_name, config.expected_insertions, config.false_positive_rate
                );
                Arc::new(Mutex::new(BloomFilterState::new(&config)))
            });
        Ok(Arc::clone(state.value()))
    }
}
