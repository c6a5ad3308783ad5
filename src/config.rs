//! Configuration consumed by the tiered cache.
//!
//! The cache never parses configuration files. Hosts bind these structs
//! (they all implement `Deserialize`) or build them in code, and hand the
//! per-cache settings over through [`CacheSpecificationResolver`] and
//! [`BloomFilterConfigProvider`].

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Default invalidation channel name.
pub const DEFAULT_INVALIDATION_CHANNEL: &str = "tier-cache:invalidation";

/// Per-cache-name settings.
///
/// Immutable once resolved. Only validated specifications reach the cache:
/// [`CacheSpecification::validate`] is applied by the manager before a
/// cache handle is created.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheSpecification {
    /// Default TTL of local (L1) entries. Zero means no expiry.
    pub ttl_local: Duration,
    /// Default TTL of remote (L2) entries. Zero means no expiry.
    pub ttl_remote: Duration,
    /// Maximum number of entries kept locally.
    pub local_max_size: usize,
    /// Whether the bloom filter is consulted and fed for this cache.
    pub enable_bloom_filter: bool,
    /// Whether evict/clear publish invalidation messages to other nodes.
    pub enable_invalidation_notify: bool,
    /// Whether "no value" is cached as a null marker.
    pub allow_null_values: bool,
}

impl Default for CacheSpecification {
    fn default() -> Self {
        CacheSpecification {
            ttl_local: Duration::from_secs(60),
            ttl_remote: Duration::from_secs(600),
            local_max_size: 10_000,
            enable_bloom_filter: false,
            enable_invalidation_notify: true,
            allow_null_values: false,
        }
    }
}

impl CacheSpecification {
    pub fn with_ttl_local(mut self, ttl: Duration) -> Self {
        self.ttl_local = ttl;
        self
    }

    pub fn with_ttl_remote(mut self, ttl: Duration) -> Self {
        self.ttl_remote = ttl;
        self
    }

    pub fn with_local_max_size(mut self, size: usize) -> Self {
        self.local_max_size = size;
        self
    }

    pub fn with_bloom_filter(mut self, enabled: bool) -> Self {
        self.enable_bloom_filter = enabled;
        self
    }

    pub fn with_invalidation_notify(mut self, enabled: bool) -> Self {
        self.enable_invalidation_notify = enabled;
        self
    }

    pub fn with_null_values(mut self, allowed: bool) -> Self {
        self.allow_null_values = allowed;
        self
    }

    /// Check the invariants the cache relies on.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if `local_max_size` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.local_max_size == 0 {
            return Err(Error::ConfigError(
                "local_max_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Supplies the [`CacheSpecification`] of each cache name.
pub trait CacheSpecificationResolver: Send + Sync {
    /// Resolve the specification for a cache name.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if no specification exists for the name.
    fn resolve(&self, cache_name: &str) -> Result<CacheSpecification>;
}

/// Resolver backed by a fixed per-name map with an optional fallback.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct StaticSpecificationResolver {
    pub caches: HashMap<String, CacheSpecification>,
    pub default: Option<CacheSpecification>,
}

impl StaticSpecificationResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache(mut self, name: impl Into<String>, spec: CacheSpecification) -> Self {
        self.caches.insert(name.into(), spec);
        self
    }

    pub fn with_default(mut self, spec: CacheSpecification) -> Self {
        self.default = Some(spec);
        self
    }
}

impl CacheSpecificationResolver for StaticSpecificationResolver {
    fn resolve(&self, cache_name: &str) -> Result<CacheSpecification> {
        self.caches
            .get(cache_name)
            .or(self.default.as_ref())
            .cloned()
            .ok_or_else(|| {
                Error::ConfigError(format!("No cache specification for '{}'", cache_name))
            })
    }
}

/// Bloom filter settings of one cache name.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct BloomFilterConfig {
    pub enabled: bool,
    pub expected_insertions: u64,
    pub false_positive_rate: f64,
}

impl Default for BloomFilterConfig {
    fn default() -> Self {
        BloomFilterConfig {
            enabled: true,
            expected_insertions: 100_000,
            false_positive_rate: 0.01,
        }
    }
}

impl BloomFilterConfig {
    pub fn disabled() -> Self {
        BloomFilterConfig {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_expected_insertions(mut self, expected: u64) -> Self {
        self.expected_insertions = expected;
        self
    }

    pub fn with_false_positive_rate(mut self, rate: f64) -> Self {
        self.false_positive_rate = rate;
        self
    }

    /// # Errors
    ///
    /// Returns `Error::ConfigError` for zero expected insertions or a false
    /// positive rate outside `(0, 1)`.
    pub fn validate(&self) -> Result<()> {
        if self.expected_insertions == 0 {
            return Err(Error::ConfigError(
                "expected_insertions must be greater than zero".to_string(),
            ));
        }
        if !(self.false_positive_rate > 0.0 && self.false_positive_rate < 1.0) {
            return Err(Error::ConfigError(format!(
                "false_positive_rate must be in (0, 1), got {}",
                self.false_positive_rate
            )));
        }
        Ok(())
    }
}

/// Supplies bloom filter settings per cache name on demand.
pub trait BloomFilterConfigProvider: Send + Sync {
    fn bloom_filter_config(&self, cache_name: &str) -> BloomFilterConfig;
}

/// Provider backed by a per-name map with a fallback.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct StaticBloomFilterConfig {
    pub caches: HashMap<String, BloomFilterConfig>,
    pub default: BloomFilterConfig,
}

impl StaticBloomFilterConfig {
    pub fn new(default: BloomFilterConfig) -> Self {
        StaticBloomFilterConfig {
            caches: HashMap::new(),
            default,
        }
    }

    pub fn with_cache(mut self, name: impl Into<String>, config: BloomFilterConfig) -> Self {
        self.caches.insert(name.into(), config);
        self
    }
}

impl BloomFilterConfigProvider for StaticBloomFilterConfig {
    fn bloom_filter_config(&self, cache_name: &str) -> BloomFilterConfig {
        self.caches
            .get(cache_name)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// Stampede guard settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StampedeConfig {
    /// Collapse concurrent misses of the same key into one load.
    pub enabled: bool,
    /// Longest time a caller waits for the distributed lock.
    pub lock_wait: Duration,
    /// Lease after which a lock is released even if its holder died.
    pub lock_lease: Duration,
    /// Pause between distributed lock attempts.
    pub retry_interval: Duration,
    /// Use the in-process lock table when the distributed lock is unusable.
    pub local_fallback: bool,
    /// Non-blocking attempts on the in-process lock before giving up.
    pub local_retries: u32,
    /// Pause between in-process lock attempts.
    pub local_retry_interval: Duration,
    /// Soft bound of the in-process lock table.
    pub lock_table_capacity: usize,
}

impl Default for StampedeConfig {
    fn default() -> Self {
        StampedeConfig {
            enabled: true,
            lock_wait: Duration::from_secs(3),
            lock_lease: Duration::from_secs(30),
            retry_interval: Duration::from_millis(20),
            local_fallback: true,
            local_retries: 3,
            local_retry_interval: Duration::from_millis(10),
            lock_table_capacity: 1_000,
        }
    }
}

impl StampedeConfig {
    pub fn disabled() -> Self {
        StampedeConfig {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    pub fn with_local_fallback(mut self, enabled: bool) -> Self {
        self.local_fallback = enabled;
        self
    }
}

/// Invalidation bus settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
    /// Pub/sub channel shared by every node.
    pub channel: String,
    /// Delay before the post-evict re-check.
    pub recheck_delay: Duration,
    /// Publish the invalidation a second time when the re-check runs.
    pub recheck_republish: bool,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        InvalidationConfig {
            channel: DEFAULT_INVALIDATION_CHANNEL.to_string(),
            recheck_delay: Duration::from_millis(100),
            recheck_republish: true,
        }
    }
}

/// Top-level settings of a [`crate::CacheManager`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TieredCacheConfig {
    /// Prefix of every remote key (empty for none).
    pub key_prefix: String,
    pub stampede: StampedeConfig,
    pub invalidation: InvalidationConfig,
}

impl TieredCacheConfig {
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_stampede(mut self, stampede: StampedeConfig) -> Self {
        self.stampede = stampede;
        self
    }

    pub fn with_invalidation(mut self, invalidation: InvalidationConfig) -> Self {
        self.invalidation = invalidation;
        self
    }

    /// # Errors
    ///
    /// Returns `Error::ConfigError` for a blank channel name.
    pub fn validate(&self) -> Result<()> {
        if self.invalidation.channel.trim().is_empty() {
            return Err(Error::ConfigError(
                "invalidation channel must not be blank".to_string(),
            ));
        }
        Ok(())
    }
}
