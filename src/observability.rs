//! Metrics hooks for cache operations.
//!
//! Implement [`CacheMetrics`] to forward cache events to your monitoring
//! system:
//!
//! ```ignore
//! use tier_cache::observability::CacheMetrics;
//! use std::time::Duration;
//!
//! struct PrometheusMetrics;
//!
//! impl CacheMetrics for PrometheusMetrics {
//!     fn record_hit(&self, _key: &str, _duration: Duration) {
//!         // counter!("cache_hits").inc();
//!     }
//!
//!     fn record_bloom_resize(&self, cache: &str, old: u64, old_expected: u64, new_expected: u64) {
//!         // gauge!("bloom_expected_insertions", "cache" => cache).set(new_expected as f64);
//!     }
//! }
//!
//! // let manager = CacheManager::builder(store, transport)
//! //     .metrics(Arc::new(PrometheusMetrics))
//! //     .build()?;
//! ```
//!
//! The default sink is [`NoOpMetrics`]. Installing or omitting a sink never
//! changes cache behavior; degradation events are logged by the components
//! themselves either way.
//!
//! # Events
//!
//! | Hook | Fired when |
//! |------|------------|
//! | `record_hit` | A read found a value in L1 or L2 |
//! | `record_miss` | A read found nothing in either tier |
//! | `record_set` | A write reached L2 and L1 |
//! | `record_delete` | An evict or clear completed |
//! | `record_error` | An operation surfaced an error |
//! | `record_bloom_resize` | A bloom filter was replaced by a larger one |
//! | `record_stampede_fallback` | A load ran without single-flight protection |

use std::time::Duration;

/// Trait for cache metrics collection.
pub trait CacheMetrics: Send + Sync {
    /// Record a cache hit.
    fn record_hit(&self, key: &str, duration: Duration) {
        debug!("Cache HIT: {} took {:?}", key, duration);
    }

    /// Record a cache miss.
    fn record_miss(&self, key: &str, duration: Duration) {
        debug!("Cache MISS: {} took {:?}", key, duration);
    }

    /// Record a cache set operation.
    fn record_set(&self, key: &str, duration: Duration) {
        debug!("Cache SET: {} took {:?}", key, duration);
    }

    /// Record a cache delete operation.
    fn record_delete(&self, key: &str, duration: Duration) {
        debug!("Cache DELETE: {} took {:?}", key, duration);
    }

    /// Record an error.
    fn record_error(&self, key: &str, error: &str) {
        warn!("Cache ERROR for {}: {}", key, error);
    }

    /// Record a bloom filter resize.
    fn record_bloom_resize(
        &self,
        cache_name: &str,
        old_insertions: u64,
        old_expected: u64,
        new_expected: u64,
    ) {
        debug!(
            "Bloom RESIZE: {} ({} insertions, {} -> {} expected)",
            cache_name, old_insertions, old_expected, new_expected
        );
    }

    /// Record a load that ran without single-flight protection.
    fn record_stampede_fallback(&self, key: &str, reason: &str) {
        debug!("Stampede FALLBACK: {} ({})", key, reason);
    }
}

/// Default metrics implementation (no-op).
#[derive(Clone, Default)]
pub struct NoOpMetrics;

impl CacheMetrics for NoOpMetrics {
    fn record_hit(&self, _key: &str, _duration: Duration) {}
    fn record_miss(&self, _key: &str, _duration: Duration) {}
    fn record_set(&self, _key: &str, _duration: Duration) {}
    fn record_delete(&self, _key: &str, _duration: Duration) {}
    fn record_error(&self, _key: &str, _error: &str) {}
    fn record_bloom_resize(&self, _cache: &str, _old: u64, _old_expected: u64, _new: u64) {}
    fn record_stampede_fallback(&self, _key: &str, _reason: &str) {}
}

/// Metrics sink that only logs, using the trait's default hooks.
#[derive(Clone, Default)]
pub struct LogMetrics;

impl CacheMetrics for LogMetrics {}
