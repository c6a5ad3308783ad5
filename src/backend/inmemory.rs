//! In-memory remote store (default, thread-safe, async).
//!
//! Uses DashMap for concurrent access with per-key sharding. Stands in for a
//! shared remote store in tests and single-process deployments: every clone
//! shares the same data, so several cache managers built on clones behave
//! like nodes sharing one Redis.

use super::RemoteStore;
use crate::error::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// In-memory entry with optional expiration.
struct StoreEntry {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoreEntry {
    fn new(data: Vec<u8>, ttl: Option<Duration>) -> Self {
        // A TTL too large to represent never expires.
        let expires_at = ttl.and_then(|d| Instant::now().checked_add(d));
        StoreEntry { data, expires_at }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() > exp)
    }
}

/// Thread-safe async in-memory remote store.
///
/// # Example
///
/// ```no_run
/// use tier_cache::backend::{InMemoryStore, RemoteStore};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = InMemoryStore::new();
///
///     store.set("key1", b"value".to_vec(), None).await?;
///     assert!(store.get("key1").await?.is_some());
///
///     store.set("key2", b"expires".to_vec(), Some(Duration::from_secs(300))).await?;
///     assert_eq!(store.incr("counter").await?, 1);
///
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct InMemoryStore {
    data: Arc<DashMap<String, StoreEntry>>,
    locks: Arc<DashMap<String, StoreEntry>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        InMemoryStore {
            data: Arc::new(DashMap::new()),
            locks: Arc::new(DashMap::new()),
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulate an outage: while unavailable every operation fails with
    /// `Error::BackendError`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
        if unavailable {
            warn!("⚠ InMemory store marked unavailable");
        }
    }

    /// Increment a counter under its entry lock, landing on `floor` when the
    /// increment would fall short of it.
    fn bump_counter(&self, key: &str, floor: i64) -> Result<i64> {
        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| StoreEntry::new(b"0".to_vec(), None));
        if entry.is_expired() {
            *entry = StoreEntry::new(b"0".to_vec(), None);
        }

        let current = std::str::from_utf8(&entry.data)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| {
                Error::BackendError(format!("INCR on non-integer value at {}", key))
            })?;
        let next = current
            .checked_add(1)
            .ok_or_else(|| Error::BackendError(format!("INCR overflow at {}", key)))?
            .max(floor);
        entry.data = next.to_string().into_bytes();
        Ok(next)
    }

    fn check_available(&self, op: &str) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::BackendError(format!(
                "InMemory store unavailable ({})",
                op
            )));
        }
        Ok(())
    }

    /// Get the current number of entries, locks excluded.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if store is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Snapshot of live keys.
    pub fn keys(&self) -> Vec<String> {
        self.data
            .iter()
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Get memory statistics.
    pub fn stats(&self) -> StoreStats {
        let total_bytes: usize = self.data.iter().map(|entry| entry.data.len()).sum();
        let expired_count = self.data.iter().filter(|entry| entry.is_expired()).count();

        StoreStats {
            total_entries: self.data.len(),
            expired_entries: expired_count,
            total_bytes,
            held_locks: self.locks.iter().filter(|l| !l.is_expired()).count(),
        }
    }

    /// Remove every entry and lock.
    pub fn clear_all(&self) {
        self.data.clear();
        self.locks.clear();
        warn!("⚠ InMemory CLEAR_ALL executed - all entries cleared!");
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_available("GET")?;

        if let Some(entry) = self.data.get(key) {
            if !entry.is_expired() {
                debug!("✓ InMemory GET {} -> HIT", key);
                return Ok(Some(entry.data.clone()));
            }
        }

        self.data.remove_if(key, |_, entry| entry.is_expired());
        debug!("✓ InMemory GET {} -> MISS", key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.check_available("SET")?;

        self.data
            .insert(key.to_string(), StoreEntry::new(value, ttl));

        if let Some(d) = ttl {
            debug!("✓ InMemory SET {} (TTL: {:?})", key, d);
        } else {
            debug!("✓ InMemory SET {}", key);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available("DELETE")?;

        self.data.remove(key);
        debug!("✓ InMemory DELETE {}", key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_available("EXISTS")?;

        Ok(self
            .data
            .get(key)
            .is_some_and(|entry| !entry.is_expired()))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        self.check_available("MGET")?;

        let results: Vec<Option<Vec<u8>>> = keys
            .iter()
            .map(|k| {
                self.data
                    .get(k)
                    .filter(|entry| !entry.is_expired())
                    .map(|entry| entry.data.clone())
            })
            .collect();

        debug!("✓ InMemory MGET {} keys", keys.len());
        Ok(results)
    }

    async fn mset(&self, entries: Vec<(String, Vec<u8>)>, ttl: Option<Duration>) -> Result<()> {
        self.check_available("MSET")?;

        let count = entries.len();
        for (key, value) in entries {
            self.data.insert(key, StoreEntry::new(value, ttl));
        }
        debug!("✓ InMemory MSET {} keys", count);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.check_available("INCR")?;
        let next = self.bump_counter(key, i64::MIN)?;
        debug!("✓ InMemory INCR {} -> {}", key, next);
        Ok(next)
    }

    async fn incr_at_least(&self, key: &str, floor: i64) -> Result<i64> {
        self.check_available("INCR")?;
        let next = self.bump_counter(key, floor)?;
        debug!("✓ InMemory INCR {} (floor {}) -> {}", key, floor, next);
        Ok(next)
    }

    async fn try_lock(&self, name: &str, token: &str, lease: Duration) -> Result<bool> {
        self.check_available("LOCK")?;

        let acquired = match self.locks.entry(name.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().is_expired() {
                    held.insert(StoreEntry::new(token.as_bytes().to_vec(), Some(lease)));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(StoreEntry::new(token.as_bytes().to_vec(), Some(lease)));
                true
            }
        };

        debug!("✓ InMemory LOCK {} -> {}", name, acquired);
        Ok(acquired)
    }

    async fn unlock(&self, name: &str, token: &str) -> Result<bool> {
        self.check_available("UNLOCK")?;

        let released = self
            .locks
            .remove_if(name, |_, held| {
                !held.is_expired() && held.data == token.as_bytes()
            })
            .is_some();

        debug!("✓ InMemory UNLOCK {} -> {}", name, released);
        Ok(released)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(!self.unavailable.load(Ordering::SeqCst))
    }
}

/// Store statistics.
#[derive(Clone, Debug)]
pub struct StoreStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub total_bytes: usize,
    pub held_locks: usize,
}
