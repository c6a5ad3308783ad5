//! Remote (L2) store implementations.

use crate::error::Result;
use std::future::Future;
use std::time::Duration;

pub mod inmemory;
#[cfg(feature = "redis")]
pub mod redis;

pub use inmemory::InMemoryStore;
#[cfg(feature = "redis")]
pub use redis::{PoolStats, RedisBackend, RedisConfig};

/// Trait for the shared remote store behind the L2 tier.
///
/// Abstracts the primitives the tiered cache needs from a shared store:
/// byte values with TTL, an atomic counter (namespace versions) and a leased
/// mutual-exclusion key (stampede locks).
///
/// **IMPORTANT:** All methods use `&self` instead of `&mut self` to allow concurrent access.
/// Implementations should use interior mutability or external storage.
///
/// **ASYNC:** All methods return `Send` futures so they can be driven from
/// spawned background tasks (delayed re-checks, async inserts).
pub trait RemoteStore: Send + Sync + Clone + 'static {
    /// Retrieve value by key.
    ///
    /// # Returns
    /// - `Ok(Some(bytes))` - Value found
    /// - `Ok(None)` - Key not found
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs (connection lost, etc.)
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Store value with optional TTL (`None` = no expiration).
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Remove value.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Check if key exists.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    fn exists(&self, key: &str) -> impl Future<Output = Result<bool>> + Send {
        async move { Ok(self.get(key).await?.is_some()) }
    }

    /// Bulk get, one result per requested key in order.
    ///
    /// Implementations pipeline the reads. A failure on one key yields `None`
    /// for that key only; a failure of the whole batch is an `Err`.
    ///
    /// # Errors
    /// Returns `Err` if the batch as a whole fails
    fn mget(&self, keys: &[String]) -> impl Future<Output = Result<Vec<Option<Vec<u8>>>>> + Send {
        async move {
            let mut results = Vec::with_capacity(keys.len());
            for key in keys {
                results.push(self.get(key).await.unwrap_or(None));
            }
            Ok(results)
        }
    }

    /// Bulk set with a shared TTL.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    fn mset(
        &self,
        entries: Vec<(String, Vec<u8>)>,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send {
        async move {
            for (key, value) in entries {
                self.set(&key, value, ttl).await?;
            }
            Ok(())
        }
    }

    /// Atomically increment an integer counter, creating it at 1.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs or the key holds a non-integer
    fn incr(&self, key: &str) -> impl Future<Output = Result<i64>> + Send;

    /// Increment a counter so the result is never below `floor`.
    ///
    /// The counter only moves forward: concurrent callers each observe a
    /// distinct value and the stored value is the largest one handed out.
    /// The default retries [`RemoteStore::incr`] until it reaches `floor`;
    /// backends override it with a single atomic step.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs or the key holds a non-integer
    fn incr_at_least(&self, key: &str, floor: i64) -> impl Future<Output = Result<i64>> + Send {
        async move {
            loop {
                let value = self.incr(key).await?;
                if value >= floor {
                    return Ok(value);
                }
            }
        }
    }

    /// Read an integer counter written by [`RemoteStore::incr`].
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    fn get_counter(&self, key: &str) -> impl Future<Output = Result<Option<i64>>> + Send {
        async move {
            Ok(self
                .get(key)
                .await?
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .and_then(|s| s.trim().parse::<i64>().ok()))
        }
    }

    /// Try once to take a leased lock: succeeds only if `name` is not held.
    ///
    /// The lock is released automatically after `lease`.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    fn try_lock(
        &self,
        name: &str,
        token: &str,
        lease: Duration,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Release a lock if it is still held with `token`.
    ///
    /// Returns whether the lock was released by this call.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    fn unlock(&self, name: &str, token: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Health check - verify backend is accessible.
    ///
    /// # Errors
    /// Returns `Err` if backend is not accessible
    fn health_check(&self) -> impl Future<Output = Result<bool>> + Send {
        async { Ok(true) }
    }
}
