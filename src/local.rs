//! Local (L1) cache: bounded, per-cache-name, in-process.
//!
//! Entries expire by TTL (checked on access) and by size: once a cache holds
//! `max_size` entries, writing a new key evicts the least recently used one.
//! The local tier has no cross-process visibility; other nodes' copies are
//! dropped through the invalidation bus.

use crate::config::CacheSpecification;
use crate::error::{Error, Result};
use crate::ttl::{Expiry, Ttl};
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Local cache entry with optional expiration.
struct LocalEntry {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl LocalEntry {
    fn new(data: Vec<u8>, ttl: Option<Duration>) -> Self {
        // A TTL too large to represent never expires.
        let expires_at = ttl.and_then(|d| Instant::now().checked_add(d));
        LocalEntry { data, expires_at }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() >= exp)
    }
}

struct LocalInner {
    name: String,
    default_ttl: Duration,
    entries: Mutex<LruCache<String, LocalEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Thread-safe bounded LRU cache of encoded values for one cache name.
///
/// Cloning is cheap and clones share the same entries.
///
/// # Example
///
/// ```
/// use tier_cache::local::LocalCache;
/// use tier_cache::ttl::Ttl;
/// use std::time::Duration;
///
/// let cache = LocalCache::new("users", 2, Duration::from_secs(60)).unwrap();
/// cache.put("a", b"1".to_vec(), Ttl::Default);
/// cache.put("b", b"2".to_vec(), Ttl::Never);
/// cache.put("c", b"3".to_vec(), Ttl::Default);
///
/// assert!(cache.get("a").is_none()); // least recently used, evicted
/// assert_eq!(cache.get("c"), Some(b"3".to_vec()));
/// ```
#[derive(Clone)]
pub struct LocalCache {
    inner: Arc<LocalInner>,
}

impl LocalCache {
    /// Create a local cache.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if `max_size` is zero.
    pub fn new(name: impl Into<String>, max_size: usize, default_ttl: Duration) -> Result<Self> {
        let capacity = NonZeroUsize::new(max_size).ok_or_else(|| {
            Error::ConfigError("local cache max size must be greater than zero".to_string())
        })?;

        Ok(LocalCache {
            inner: Arc::new(LocalInner {
                name: name.into(),
                default_ttl,
                entries: Mutex::new(LruCache::new(capacity)),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        })
    }

    /// Create a local cache sized and timed from a specification.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if the specification is invalid.
    pub fn from_specification(name: impl Into<String>, spec: &CacheSpecification) -> Result<Self> {
        spec.validate()?;
        Self::new(name, spec.local_max_size, spec.ttl_local)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.entries.lock().cap().get()
    }

    /// Retrieve the encoded value of a key, dropping it if expired.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let key = key.to_string();
        let mut entries = self.inner.entries.lock();

        let expired = match entries.get(&key) {
            Some(entry) if !entry.is_expired() => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.data.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            entries.pop(&key);
        }
        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store an encoded value.
    ///
    /// `Ttl::Default` uses the cache-level TTL; a zero TTL removes the key
    /// instead of writing it.
    pub fn put(&self, key: &str, value: Vec<u8>, ttl: Ttl) {
        let expiry = ttl.resolve(self.inner.default_ttl);
        self.put_with_expiry(key, value, expiry);
    }

    pub(crate) fn put_with_expiry(&self, key: &str, value: Vec<u8>, expiry: Expiry) {
        if expiry == Expiry::Evict {
            self.evict(key);
            debug!("✓ Local PUT {}:{} with zero TTL -> evicted", self.inner.name, key);
            return;
        }

        let key = key.to_string();
        let entry = LocalEntry::new(value, expiry.as_duration());
        let mut entries = self.inner.entries.lock();
        if let Some((evicted_key, _)) = entries.push(key.clone(), entry) {
            if evicted_key != key {
                self.inner.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Local cache {} full, evicted least recently used {}",
                    self.inner.name, evicted_key
                );
            }
        }
    }

    /// Remove a key. Returns whether an entry was present.
    pub fn evict(&self, key: &str) -> bool {
        let removed = self.inner.entries.lock().pop(&key.to_string()).is_some();
        debug!("✓ Local EVICT {}:{}", self.inner.name, key);
        removed
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.inner.entries.lock().clear();
        debug!("✓ Local CLEAR {}", self.inner.name);
    }

    /// Drop expired entries eagerly. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.inner.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    /// Number of entries, including expired ones not yet dropped.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> LocalCacheStats {
        LocalCacheStats {
            entries: self.len(),
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Local cache statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Process-wide table of local caches, keyed by cache name.
///
/// The inbound side of the invalidation bus uses it to find the local cache
/// a message addresses.
#[derive(Clone, Default)]
pub struct LocalCacheRegistry {
    caches: Arc<DashMap<String, LocalCache>>,
}

impl LocalCacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<LocalCache> {
        self.caches.get(name).map(|c| c.clone())
    }

    /// Return the local cache of a name, creating it from the specification
    /// on first use.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if the specification is invalid.
    pub fn get_or_create(&self, name: &str, spec: &CacheSpecification) -> Result<LocalCache> {
        if let Some(cache) = self.get(name) {
            return Ok(cache);
        }
        let created = LocalCache::from_specification(name, spec)?;
        Ok(self
            .caches
            .entry(name.to_string())
            .or_insert(created)
            .clone())
    }

    pub fn remove(&self, name: &str) -> Option<LocalCache> {
        self.caches.remove(name).map(|(_, cache)| cache)
    }

    pub fn names(&self) -> Vec<String> {
        self.caches.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }
}
