//! Remote (L2) cache adapter with versioned namespaces.
//!
//! Every remote key has the form `prefix:{cache}:v{version}:{key}`. The
//! version of a cache name lives in the store under
//! `prefix:{cache}:__version__`; clearing a cache increments it, which makes
//! every key written under the old version unaddressable without a scan.
//! Orphaned entries expire through their own TTL.

use crate::backend::RemoteStore;
use crate::error::{Error, Result};
use crate::key::CacheKeyBuilder;
use crate::serialization::{Cached, ValueCodec};
use crate::ttl::Expiry;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;

/// Version a cache name has before its first clear.
pub const INITIAL_VERSION: i64 = 1;

/// Typed access to the shared remote store.
///
/// Keys passed in are canonical keys (see [`crate::key::canonical_key`]);
/// the adapter adds prefix and versioned namespace.
#[derive(Clone)]
pub struct RemoteCache<S: RemoteStore> {
    store: S,
    key_prefix: String,
    codec: ValueCodec,
}

impl<S: RemoteStore> RemoteCache<S> {
    pub fn new(store: S, key_prefix: impl Into<String>, codec: ValueCodec) -> Self {
        RemoteCache {
            store,
            key_prefix: key_prefix.into(),
            codec,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn codec(&self) -> &ValueCodec {
        &self.codec
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Current namespace version of a cache name.
    ///
    /// Uninitialized or non-positive counters read as [`INITIAL_VERSION`].
    ///
    /// # Errors
    /// Returns `Err` if the store cannot be reached
    pub async fn current_version(&self, cache_name: &str) -> Result<i64> {
        let version_key = CacheKeyBuilder::version_key(&self.key_prefix, cache_name);
        Ok(match self.store.get_counter(&version_key).await? {
            Some(version) if version > 0 => version,
            _ => INITIAL_VERSION,
        })
    }

    /// Full remote key of `key` under the current version of `cache_name`.
    ///
    /// # Errors
    /// - `Error::IllegalState` if the built key is empty
    /// - `Error::BackendError` if the version cannot be read
    pub async fn build_key(&self, cache_name: &str, key: &str) -> Result<String> {
        let version = self.current_version(cache_name).await?;
        self.key_for_version(cache_name, version, key)
    }

    fn key_for_version(&self, cache_name: &str, version: i64, key: &str) -> Result<String> {
        let namespace = CacheKeyBuilder::versioned_namespace(cache_name, version);
        let full = CacheKeyBuilder::build(&self.key_prefix, &namespace, key);
        if full.is_empty() {
            return Err(Error::IllegalState(format!(
                "Remote key for cache '{}' is empty",
                cache_name
            )));
        }
        Ok(full)
    }

    /// Raw encoded bytes of an entry.
    ///
    /// # Errors
    /// Returns `Err` if the store cannot be reached
    pub async fn get_bytes(&self, cache_name: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let remote_key = self.build_key(cache_name, key).await?;
        self.store.get(&remote_key).await
    }

    /// Typed read.
    ///
    /// Returns `Ok(None)` on a miss. Entries whose bytes cannot be decoded are
    /// deleted and reported as a miss.
    ///
    /// # Errors
    /// - `Error::TypeMismatch` if the stored type is not `V`
    /// - `Error::BackendError` if the store cannot be reached
    pub async fn get<V: DeserializeOwned>(
        &self,
        cache_name: &str,
        key: &str,
    ) -> Result<Option<Cached<V>>> {
        Ok(self
            .get_entry::<V>(cache_name, key)
            .await?
            .map(|(cached, _)| cached))
    }

    /// Typed read that also hands back the encoded bytes, for back-filling L1.
    ///
    /// # Errors
    /// Same as [`RemoteCache::get`]
    pub async fn get_entry<V: DeserializeOwned>(
        &self,
        cache_name: &str,
        key: &str,
    ) -> Result<Option<(Cached<V>, Vec<u8>)>> {
        let remote_key = self.build_key(cache_name, key).await?;
        let bytes = match self.store.get(&remote_key).await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        match self.codec.decode::<V>(&bytes) {
            Ok(cached) => Ok(Some((cached, bytes))),
            Err(e) if e.is_corrupt_entry() => {
                self.drop_unreadable(&remote_key, &e).await;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn drop_unreadable(&self, remote_key: &str, cause: &Error) {
        warn!("⚠ Dropping unreadable remote entry {}: {}", remote_key, cause);
        if let Err(e) = self.store.delete(remote_key).await {
            warn!("Failed to delete unreadable entry {}: {}", remote_key, e);
        }
    }

    /// Write a value, `None` writing the null marker.
    ///
    /// A `None` value on a cache that does not allow nulls, or an
    /// [`Expiry::Evict`], removes the entry instead. Returns the encoded bytes
    /// that were written, if any.
    ///
    /// # Errors
    /// Returns `Err` on encoding or store failure
    pub async fn put<V: Serialize + ?Sized>(
        &self,
        cache_name: &str,
        key: &str,
        value: Option<&V>,
        expiry: Expiry,
        allow_null: bool,
    ) -> Result<Option<Vec<u8>>> {
        if value.is_none() && !allow_null {
            debug!("Null value for {}:{} not cacheable, evicting", cache_name, key);
            self.evict(cache_name, key).await?;
            return Ok(None);
        }
        if expiry == Expiry::Evict {
            self.evict(cache_name, key).await?;
            return Ok(None);
        }

        let bytes = self.codec.encode(value)?;
        self.put_bytes(cache_name, key, bytes.clone(), expiry).await?;
        Ok(Some(bytes))
    }

    /// Write already encoded bytes.
    ///
    /// # Errors
    /// Returns `Err` if the store cannot be reached
    pub async fn put_bytes(
        &self,
        cache_name: &str,
        key: &str,
        bytes: Vec<u8>,
        expiry: Expiry,
    ) -> Result<()> {
        let remote_key = self.build_key(cache_name, key).await?;
        match expiry {
            Expiry::Evict => self.store.delete(&remote_key).await,
            other => {
                self.store
                    .set(&remote_key, bytes, other.as_duration())
                    .await?;
                debug!("✓ Remote PUT {} ({:?})", remote_key, other);
                Ok(())
            }
        }
    }

    /// Remove an entry under the current version.
    ///
    /// # Errors
    /// Returns `Err` if the store cannot be reached
    pub async fn evict(&self, cache_name: &str, key: &str) -> Result<()> {
        let remote_key = self.build_key(cache_name, key).await?;
        self.store.delete(&remote_key).await?;
        debug!("✓ Remote EVICT {}", remote_key);
        Ok(())
    }

    /// Whether an entry exists under the current version.
    ///
    /// # Errors
    /// Returns `Err` if the store cannot be reached
    pub async fn exists(&self, cache_name: &str, key: &str) -> Result<bool> {
        let remote_key = self.build_key(cache_name, key).await?;
        self.store.exists(&remote_key).await
    }

    /// Logically clear a cache name by bumping its version.
    ///
    /// Nothing is deleted. Returns the new version.
    ///
    /// # Errors
    /// Returns `Err` if the store cannot be reached
    pub async fn clear(&self, cache_name: &str) -> Result<i64> {
        let version_key = CacheKeyBuilder::version_key(&self.key_prefix, cache_name);
        // A missing or non-positive counter reads as the initial version, so
        // the bump has to land past it.
        let version = self
            .store
            .incr_at_least(&version_key, INITIAL_VERSION + 1)
            .await?;

        info!("✓ Remote CLEAR {} -> v{}", cache_name, version);
        Ok(version)
    }

    /// Pipelined read of many keys, returning the encoded bytes found.
    ///
    /// Keys that fail individually are absent from the result. If the batch
    /// as a whole fails, the result is empty.
    ///
    /// # Errors
    /// Returns `Err` only if the namespace version cannot be read
    pub async fn get_all_bytes(
        &self,
        cache_name: &str,
        keys: &[String],
    ) -> Result<HashMap<String, Vec<u8>>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let version = self.current_version(cache_name).await?;
        let remote_keys = keys
            .iter()
            .map(|key| self.key_for_version(cache_name, version, key))
            .collect::<Result<Vec<_>>>()?;

        let values = match self.store.mget(&remote_keys).await {
            Ok(values) => values,
            Err(e) => {
                warn!(
                    "⚠ Remote MGET of {} keys in {} failed: {}",
                    keys.len(),
                    cache_name,
                    e
                );
                return Ok(HashMap::new());
            }
        };

        let found: HashMap<String, Vec<u8>> = keys
            .iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|bytes| (key.clone(), bytes)))
            .collect();

        debug!(
            "✓ Remote MGET {} -> {}/{} found",
            cache_name,
            found.len(),
            keys.len()
        );
        Ok(found)
    }

    /// Typed pipelined read of many keys.
    ///
    /// Unreadable entries are skipped like misses.
    ///
    /// # Errors
    /// - `Error::TypeMismatch` if any stored type is not `V`
    /// - `Error::BackendError` if the namespace version cannot be read
    pub async fn get_all<V: DeserializeOwned>(
        &self,
        cache_name: &str,
        keys: &[String],
    ) -> Result<HashMap<String, Cached<V>>> {
        let mut decoded = HashMap::new();
        for (key, bytes) in self.get_all_bytes(cache_name, keys).await? {
            match self.codec.decode::<V>(&bytes) {
                Ok(cached) => {
                    decoded.insert(key, cached);
                }
                Err(e) if e.is_corrupt_entry() => {
                    warn!("⚠ Skipping unreadable remote entry {}:{}: {}", cache_name, key, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(decoded)
    }

    /// Pipelined write of many values sharing one expiry.
    ///
    /// Returns the encoded entries that were written.
    ///
    /// # Errors
    /// Returns `Err` on encoding or store failure
    pub async fn put_all<V: Serialize + ?Sized>(
        &self,
        cache_name: &str,
        entries: &[(String, &V)],
        expiry: Expiry,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let version = self.current_version(cache_name).await?;

        if expiry == Expiry::Evict {
            for (key, _) in entries {
                let remote_key = self.key_for_version(cache_name, version, key)?;
                self.store.delete(&remote_key).await?;
            }
            return Ok(Vec::new());
        }

        let mut encoded = Vec::with_capacity(entries.len());
        let mut batch = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let bytes = self.codec.encode::<V>(Some(*value))?;
            batch.push((self.key_for_version(cache_name, version, key)?, bytes.clone()));
            encoded.push((key.clone(), bytes));
        }

        self.store.mset(batch, expiry.as_duration()).await?;
        debug!("✓ Remote MSET {} -> {} keys", cache_name, encoded.len());
        Ok(encoded)
    }

    /// Read-through without single-flight protection.
    ///
    /// A cached null is returned as `None` without calling the loader.
    ///
    /// # Errors
    /// Returns `Err` on store, codec or loader failure
    pub async fn get_or_load<V, F, Fut>(
        &self,
        cache_name: &str,
        key: &str,
        loader: F,
        expiry: Expiry,
        allow_null: bool,
    ) -> Result<Option<V>>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>>>,
    {
        if let Some(cached) = self.get::<V>(cache_name, key).await? {
            return Ok(cached.into_option());
        }

        let loaded = loader().await?;
        self.put(cache_name, key, loaded.as_ref(), expiry, allow_null)
            .await?;
        Ok(loaded)
    }
}
