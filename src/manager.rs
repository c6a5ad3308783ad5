//! Cache orchestrator: the façade an application holds.
//!
//! [`CacheManager`] owns the shared machinery (remote tier, local cache
//! registry, bloom filters, invalidation bus, stampede guard) and hands out a
//! [`TieredCache`] per cache name.
//!
//! ```ignore
//! use tier_cache::{CacheManager, CacheSpecification, StaticSpecificationResolver};
//! use tier_cache::backend::InMemoryStore;
//! use tier_cache::invalidation::LocalBroadcastTransport;
//!
//! let manager = CacheManager::builder(InMemoryStore::new(), LocalBroadcastTransport::new())
//!     .resolver(StaticSpecificationResolver::new().with_default(CacheSpecification::default()))
//!     .build()?;
//! manager.start().await?;
//!
//! let users = manager.cache("users")?;
//! users.put(&42u64, &user).await?;
//! let user: Option<User> = users.get(&42u64).await?;
//! let user = users.get_or_load(&7u64, || async { repo.find(7).await }).await?;
//! ```
//!
//! Reads go L1, then the bloom filter (which only informs), then L2 with an
//! L1 back-fill. Writes go L2, then L1, then the bloom filter. Evict and
//! clear additionally publish an invalidation message to peers.

use crate::backend::RemoteStore;
use crate::bloom::{BloomFilterManager, BloomFilterStats};
use crate::config::{
    BloomFilterConfigProvider, CacheSpecification, CacheSpecificationResolver,
    StaticBloomFilterConfig, StaticSpecificationResolver, TieredCacheConfig,
};
use crate::error::{Error, Result};
use crate::invalidation::{
    InvalidationBus, InvalidationMessage, InvalidationStats, InvalidationTransport,
};
use crate::key::{entry_key, CacheKeyBuilder};
use crate::local::{LocalCache, LocalCacheRegistry, LocalCacheStats};
use crate::observability::{CacheMetrics, NoOpMetrics};
use crate::remote::RemoteCache;
use crate::serialization::{Cached, DynamicValue, TypeRegistry, ValueCodec};
use crate::stampede::{Acquisition, FallbackReason, StampedeGuard};
use crate::strategy::CacheStrategy;
use crate::ttl::{Expiry, Ttl};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use uuid::Uuid;

struct Shared<S: RemoteStore, P: InvalidationTransport> {
    config: TieredCacheConfig,
    node_id: String,
    resolver: Arc<dyn CacheSpecificationResolver>,
    specs: DashMap<String, CacheSpecification>,
    remote: RemoteCache<S>,
    locals: LocalCacheRegistry,
    bloom: Arc<BloomFilterManager>,
    bus: Arc<InvalidationBus<P>>,
    guard: StampedeGuard<S>,
    metrics: Arc<dyn CacheMetrics>,
}

/// Builder for [`CacheManager`].
pub struct CacheManagerBuilder<S: RemoteStore, P: InvalidationTransport> {
    store: S,
    transport: P,
    config: TieredCacheConfig,
    resolver: Option<Arc<dyn CacheSpecificationResolver>>,
    bloom_config: Option<Arc<dyn BloomFilterConfigProvider>>,
    metrics: Option<Arc<dyn CacheMetrics>>,
    type_registry: Option<Arc<TypeRegistry>>,
    node_id: Option<String>,
}

impl<S: RemoteStore, P: InvalidationTransport> CacheManagerBuilder<S, P> {
    pub fn config(mut self, config: TieredCacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn resolver(mut self, resolver: impl CacheSpecificationResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn bloom_config(mut self, provider: impl BloomFilterConfigProvider + 'static) -> Self {
        self.bloom_config = Some(Arc::new(provider));
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn type_registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.type_registry = Some(registry);
        self
    }

    /// Identity stamped on outbound invalidations. Defaults to a fresh UUID.
    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// # Errors
    /// Returns `Error::ConfigError` if the configuration is invalid
    pub fn build(self) -> Result<CacheManager<S, P>> {
        self.config.validate()?;

        let node_id = self
            .node_id
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let resolver = self.resolver.unwrap_or_else(|| {
            Arc::new(StaticSpecificationResolver::new().with_default(CacheSpecification::default()))
        });
        let bloom_config = self
            .bloom_config
            .unwrap_or_else(|| Arc::new(StaticBloomFilterConfig::default()));
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(NoOpMetrics));
        let codec = ValueCodec::new(self.type_registry.unwrap_or_default());

        let locals = LocalCacheRegistry::new();
        let remote = RemoteCache::new(self.store.clone(), self.config.key_prefix.clone(), codec);
        let bloom = Arc::new(BloomFilterManager::new(bloom_config).with_metrics(metrics.clone()));
        let bus = Arc::new(InvalidationBus::new(
            self.transport,
            self.config.invalidation.channel.clone(),
            node_id.clone(),
            locals.clone(),
        ));
        let guard = StampedeGuard::new(self.store, self.config.stampede.clone());

        info!(
            "✓ Cache manager {} built (prefix '{}', channel {})",
            node_id, self.config.key_prefix, self.config.invalidation.channel
        );

        Ok(CacheManager {
            shared: Arc::new(Shared {
                config: self.config,
                node_id,
                resolver,
                specs: DashMap::new(),
                remote,
                locals,
                bloom,
                bus,
                guard,
                metrics,
            }),
        })
    }
}

/// Factory and owner of every [`TieredCache`] of a process.
///
/// Cloning is cheap; clones share all state.
pub struct CacheManager<S: RemoteStore, P: InvalidationTransport> {
    shared: Arc<Shared<S, P>>,
}

impl<S: RemoteStore, P: InvalidationTransport> Clone for CacheManager<S, P> {
    fn clone(&self) -> Self {
        CacheManager {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: RemoteStore, P: InvalidationTransport> CacheManager<S, P> {
    pub fn builder(store: S, transport: P) -> CacheManagerBuilder<S, P> {
        CacheManagerBuilder {
            store,
            transport,
            config: TieredCacheConfig::default(),
            resolver: None,
            bloom_config: None,
            metrics: None,
            type_registry: None,
            node_id: None,
        }
    }

    /// Subscribe to peer invalidations. No-op if already started.
    ///
    /// # Errors
    /// Returns `Err` if the transport subscription fails
    pub async fn start(&self) -> Result<()> {
        if self.shared.bus.is_subscribed().await {
            return Ok(());
        }
        self.shared.bus.subscribe().await
    }

    /// Stop receiving peer invalidations. No-op if not started.
    pub async fn shutdown(&self) {
        self.shared.bus.unsubscribe().await;
    }

    /// Cache handle for a name, created from its resolved specification.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if the name has no valid specification,
    /// or enables a bloom filter the bloom configuration disables
    pub fn cache(&self, name: &str) -> Result<TieredCache<S, P>> {
        if name.trim().is_empty() {
            return Err(Error::ConfigError("cache name must not be blank".to_string()));
        }

        let spec = match self.shared.specs.get(name) {
            Some(spec) => spec.clone(),
            None => {
                let spec = self.shared.resolver.resolve(name)?;
                spec.validate()?;
                if spec.enable_bloom_filter && !self.shared.bloom.is_enabled(name) {
                    return Err(Error::ConfigError(format!(
                        "Cache '{}' enables a bloom filter that is disabled in the bloom configuration",
                        name
                    )));
                }
                self.shared
                    .specs
                    .entry(name.to_string())
                    .or_insert(spec)
                    .clone()
            }
        };

        let local = self.shared.locals.get_or_create(name, &spec)?;
        Ok(TieredCache {
            name: name.to_string(),
            spec,
            local,
            shared: Arc::clone(&self.shared),
        })
    }

    pub fn cache_names(&self) -> Vec<String> {
        self.shared.specs.iter().map(|e| e.key().clone()).collect()
    }

    pub fn node_id(&self) -> &str {
        &self.shared.node_id
    }

    pub fn config(&self) -> &TieredCacheConfig {
        &self.shared.config
    }

    pub fn remote(&self) -> &RemoteCache<S> {
        &self.shared.remote
    }

    pub fn bloom(&self) -> &Arc<BloomFilterManager> {
        &self.shared.bloom
    }

    pub fn bus(&self) -> &Arc<InvalidationBus<P>> {
        &self.shared.bus
    }

    pub fn invalidation_stats(&self) -> InvalidationStats {
        self.shared.bus.stats()
    }

    pub fn local_caches(&self) -> &LocalCacheRegistry {
        &self.shared.locals
    }
}

/// Two-tier cache of one name.
///
/// Keys are any `Serialize` value; identity is their canonical form (see
/// [`crate::key::canonical_key`]), so `"42"` and `42` address the same entry.
pub struct TieredCache<S: RemoteStore, P: InvalidationTransport> {
    name: String,
    spec: CacheSpecification,
    local: LocalCache,
    shared: Arc<Shared<S, P>>,
}

impl<S: RemoteStore, P: InvalidationTransport> Clone for TieredCache<S, P> {
    fn clone(&self) -> Self {
        TieredCache {
            name: self.name.clone(),
            spec: self.spec.clone(),
            local: self.local.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: RemoteStore, P: InvalidationTransport> TieredCache<S, P> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn specification(&self) -> &CacheSpecification {
        &self.spec
    }

    pub fn local_stats(&self) -> LocalCacheStats {
        self.local.stats()
    }

    pub fn bloom_stats(&self) -> Option<BloomFilterStats> {
        self.shared.bloom.stats(&self.name)
    }

    fn bloom_enabled(&self) -> bool {
        self.spec.enable_bloom_filter
    }

    /// Bloom filter pre-check: `false` only if the key was certainly never
    /// written since the filter was last created or resized. Always `true`
    /// for caches without a bloom filter.
    ///
    /// # Errors
    /// Returns `Error::SerializationError` if the key cannot be canonicalized
    pub fn might_contain<K: Serialize + ?Sized>(&self, key: &K) -> Result<bool> {
        if !self.bloom_enabled() {
            return Ok(true);
        }
        let canonical = entry_key(key)?;
        Ok(self.shared.bloom.might_contain(&self.name, canonical.as_bytes()))
    }

    /// Read a value. A cached null reads as `None`.
    ///
    /// # Errors
    /// - `Error::TypeMismatch` if the stored type is not `V`
    /// - `Error::BackendError` if L1 misses and the remote tier is unreachable
    pub async fn get<K, V>(&self, key: &K) -> Result<Option<V>>
    where
        K: Serialize + ?Sized,
        V: DeserializeOwned,
    {
        Ok(self.lookup::<K, V>(key).await?.and_then(Cached::into_option))
    }

    /// Read distinguishing a cached null (`Some(Cached::Null)`) from a miss.
    ///
    /// # Errors
    /// Same as [`TieredCache::get`]
    pub async fn lookup<K, V>(&self, key: &K) -> Result<Option<Cached<V>>>
    where
        K: Serialize + ?Sized,
        V: DeserializeOwned,
    {
        let canonical = entry_key(key)?;
        let start = Instant::now();

        match self.read_tiers::<V>(&canonical).await {
            Ok(Some(cached)) => {
                self.shared.metrics.record_hit(&canonical, start.elapsed());
                Ok(Some(cached))
            }
            Ok(None) => {
                self.shared.metrics.record_miss(&canonical, start.elapsed());
                Ok(None)
            }
            Err(e) => {
                self.shared.metrics.record_error(&canonical, &e.to_string());
                Err(e)
            }
        }
    }

    /// Read without a static type.
    ///
    /// # Errors
    /// Returns `Error::BackendError` if L1 misses and the remote tier is
    /// unreachable
    pub async fn get_dynamic<K: Serialize + ?Sized>(&self, key: &K) -> Result<Option<DynamicValue>> {
        let canonical = entry_key(key)?;
        let codec = self.shared.remote.codec();

        if let Some(bytes) = self.local.get(&canonical) {
            match codec.decode_dynamic(&bytes) {
                Ok(value) => return Ok(Some(value)),
                Err(e) => {
                    warn!("⚠ Dropping unreadable local entry {}:{}: {}", self.name, canonical, e);
                    self.local.evict(&canonical);
                }
            }
        }

        let bytes = match self.shared.remote.get_bytes(&self.name, &canonical).await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        match codec.decode_dynamic(&bytes) {
            Ok(value) => {
                self.local.put(&canonical, bytes, Ttl::Default);
                Ok(Some(value))
            }
            Err(e) => {
                warn!("⚠ Unreadable remote entry {}:{}: {}", self.name, canonical, e);
                self.shared.remote.evict(&self.name, &canonical).await?;
                Ok(None)
            }
        }
    }

    /// Write a value with the cache-level TTLs.
    ///
    /// # Errors
    /// Returns `Err` on encoding failure or if the remote tier is unreachable
    pub async fn put<K, V>(&self, key: &K, value: &V) -> Result<()>
    where
        K: Serialize + ?Sized,
        V: Serialize + ?Sized,
    {
        self.put_with_ttl(key, value, Ttl::Default).await
    }

    /// Write a value with an explicit TTL.
    ///
    /// A zero TTL evicts the key instead, peers included. `Ttl::Never` never
    /// expires.
    ///
    /// # Errors
    /// Returns `Err` on encoding failure or if the remote tier is unreachable
    pub async fn put_with_ttl<K, V>(&self, key: &K, value: &V, ttl: Ttl) -> Result<()>
    where
        K: Serialize + ?Sized,
        V: Serialize + ?Sized,
    {
        let canonical = entry_key(key)?;
        self.write(&canonical, Some(value), ttl).await
    }

    /// Record that a key has no value.
    ///
    /// Stores the null marker when the cache allows nulls; evicts otherwise.
    ///
    /// # Errors
    /// Returns `Err` if the remote tier is unreachable
    pub async fn put_null<K: Serialize + ?Sized>(&self, key: &K) -> Result<()> {
        let canonical = entry_key(key)?;
        self.write::<()>(&canonical, None, Ttl::Default).await
    }

    /// Remove a key from both tiers and tell peers to drop it from L1.
    ///
    /// # Errors
    /// Returns `Err` if the remote tier is unreachable; L1 is evicted either way
    pub async fn evict<K: Serialize + ?Sized>(&self, key: &K) -> Result<()> {
        let canonical = entry_key(key)?;
        self.evict_canonical(&canonical).await
    }

    /// Logically clear the whole cache on every node.
    ///
    /// # Errors
    /// Returns `Err` if the remote tier is unreachable; L1 is cleared either way
    pub async fn clear(&self) -> Result<()> {
        let start = Instant::now();
        let result = self.shared.remote.clear(&self.name).await;
        self.local.clear();

        if self.spec.enable_invalidation_notify {
            self.shared.bus.publish(InvalidationMessage::clear(&self.name));
        }

        match result {
            Ok(_) => {
                self.shared.metrics.record_delete(&self.name, start.elapsed());
                Ok(())
            }
            Err(e) => {
                self.shared.metrics.record_error(&self.name, &e.to_string());
                Err(e)
            }
        }
    }

    /// Read-through with single-flight loading and the cache-level TTLs.
    ///
    /// The loader runs only on a miss in both tiers. Concurrent callers for
    /// the same missing key wait for one holder of the key's lock; a lock that
    /// cannot be had within `lock_wait` degrades to an unprotected load.
    ///
    /// # Errors
    /// - Whatever the loader returns
    /// - `Error::TypeMismatch` if the stored type is not `V`
    pub async fn get_or_load<K, V, F, Fut>(&self, key: &K, loader: F) -> Result<Option<V>>
    where
        K: Serialize + ?Sized,
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>>>,
    {
        self.get_or_load_with_ttl(key, loader, Ttl::Default).await
    }

    /// [`TieredCache::get_or_load`] with an explicit TTL for the loaded value.
    ///
    /// # Errors
    /// Same as [`TieredCache::get_or_load`]
    pub async fn get_or_load_with_ttl<K, V, F, Fut>(
        &self,
        key: &K,
        loader: F,
        ttl: Ttl,
    ) -> Result<Option<V>>
    where
        K: Serialize + ?Sized,
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>>>,
    {
        let canonical = entry_key(key)?;
        let start = Instant::now();

        if let Some(cached) = self.read_tiers_degraded::<V>(&canonical).await? {
            self.shared.metrics.record_hit(&canonical, start.elapsed());
            return Ok(cached.into_option());
        }
        self.shared.metrics.record_miss(&canonical, start.elapsed());

        let lock_name =
            CacheKeyBuilder::lock_key(self.shared.remote.key_prefix(), &self.name, &canonical);

        match self.shared.guard.acquire(&lock_name).await {
            Acquisition::Acquired(lock) => {
                let result = async {
                    if let Some(cached) = self.read_tiers_degraded::<V>(&canonical).await? {
                        debug!("✓ {}:{} populated while waiting for lock", self.name, canonical);
                        return Ok(cached.into_option());
                    }
                    self.load_and_store(&canonical, loader, ttl).await
                }
                .await;
                lock.release().await;
                result
            }
            Acquisition::Fallback(reason) => {
                self.shared
                    .metrics
                    .record_stampede_fallback(&canonical, &reason.to_string());
                if !matches!(reason, FallbackReason::Disabled) {
                    if let Some(cached) = self.read_tiers_degraded::<V>(&canonical).await? {
                        return Ok(cached.into_option());
                    }
                }
                self.load_and_store(&canonical, loader, ttl).await
            }
        }
    }

    /// Fetch according to a [`CacheStrategy`].
    ///
    /// # Errors
    /// Same as [`TieredCache::get_or_load`]
    pub async fn fetch<K, V, F, Fut>(
        &self,
        key: &K,
        strategy: CacheStrategy,
        loader: F,
    ) -> Result<Option<V>>
    where
        K: Serialize + ?Sized,
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>>>,
    {
        debug!("» Fetch {} with strategy {}", self.name, strategy);
        match strategy {
            CacheStrategy::Fresh => self.get(key).await,
            CacheStrategy::Refresh => self.get_or_load(key, loader).await,
            CacheStrategy::Invalidate => {
                let canonical = entry_key(key)?;
                if let Err(e) = self.evict_canonical(&canonical).await {
                    warn!("⚠ Invalidate of {}:{} incomplete: {}", self.name, canonical, e);
                }
                self.get_or_load(key, loader).await
            }
            CacheStrategy::Bypass => {
                let canonical = entry_key(key)?;
                self.load_and_store(&canonical, loader, Ttl::Default).await
            }
        }
    }

    /// Read many keys: L1 first, one pipelined L2 read for the rest.
    ///
    /// The result is keyed by canonical key and holds only keys with a value;
    /// misses, cached nulls and unreadable entries are absent.
    ///
    /// # Errors
    /// - `Error::TypeMismatch` if any stored type is not `V`
    /// - `Error::BackendError` if the namespace version cannot be read
    pub async fn get_all<K, V>(&self, keys: &[K]) -> Result<HashMap<String, V>>
    where
        K: Serialize,
        V: DeserializeOwned,
    {
        let codec = self.shared.remote.codec();
        let mut found = HashMap::with_capacity(keys.len());
        let mut misses = Vec::new();

        for key in keys {
            let canonical = entry_key(key)?;
            match self.read_local::<V>(&canonical)? {
                Some(Cached::Value(value)) => {
                    found.insert(canonical, value);
                }
                Some(Cached::Null) => {}
                None => misses.push(canonical),
            }
        }

        if misses.is_empty() {
            return Ok(found);
        }

        let remote = self.shared.remote.get_all_bytes(&self.name, &misses).await?;
        for (canonical, bytes) in remote {
            match codec.decode::<V>(&bytes) {
                Ok(cached) => {
                    self.local.put(&canonical, bytes, Ttl::Default);
                    if let Cached::Value(value) = cached {
                        found.insert(canonical, value);
                    }
                }
                Err(e) if e.is_corrupt_entry() => {
                    warn!("⚠ Skipping unreadable entry {}:{}: {}", self.name, canonical, e);
                }
                Err(e) => return Err(e),
            }
        }

        debug!(
            "✓ GET_ALL {} -> {}/{} found",
            self.name,
            found.len(),
            keys.len()
        );
        Ok(found)
    }

    /// Write many values with the cache-level TTLs: one pipelined L2 write,
    /// then L1 and the bloom filter.
    ///
    /// # Errors
    /// Returns `Err` on encoding failure or if the remote tier is unreachable
    pub async fn put_all<K, V>(&self, entries: &[(K, V)]) -> Result<()>
    where
        K: Serialize,
        V: Serialize,
    {
        let start = Instant::now();
        let mut canonical: Vec<(String, &V)> = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            canonical.push((entry_key(key)?, value));
        }

        let remote_expiry = Ttl::Default.resolve(self.spec.ttl_remote);
        let local_expiry = Ttl::Default.resolve(self.spec.ttl_local);
        let written = self
            .shared
            .remote
            .put_all(&self.name, &canonical, remote_expiry)
            .await?;

        for (key, bytes) in written {
            self.local.put_with_expiry(&key, bytes, local_expiry);
            self.insert_bloom(&key);
        }
        self.shared
            .metrics
            .record_set(&self.name, start.elapsed());
        Ok(())
    }

    async fn read_tiers<V: DeserializeOwned>(&self, canonical: &str) -> Result<Option<Cached<V>>> {
        if let Some(cached) = self.read_local::<V>(canonical)? {
            return Ok(Some(cached));
        }

        if self.bloom_enabled()
            && !self
                .shared
                .bloom
                .might_contain(&self.name, canonical.as_bytes())
        {
            debug!(
                "Bloom filter has no record of {}:{}, checking remote",
                self.name, canonical
            );
        }

        match self
            .shared
            .remote
            .get_entry::<V>(&self.name, canonical)
            .await?
        {
            Some((cached, bytes)) => {
                self.local.put(canonical, bytes, Ttl::Default);
                Ok(Some(cached))
            }
            None => Ok(None),
        }
    }

    /// [`TieredCache::read_tiers`] treating an unreachable remote tier as a
    /// miss. Type mismatches still propagate.
    async fn read_tiers_degraded<V: DeserializeOwned>(
        &self,
        canonical: &str,
    ) -> Result<Option<Cached<V>>> {
        match self.read_tiers::<V>(canonical).await {
            Err(Error::BackendError(e)) => {
                warn!(
                    "⚠ Remote read of {}:{} failed, treating as miss: {}",
                    self.name, canonical, e
                );
                Ok(None)
            }
            other => other,
        }
    }

    fn read_local<V: DeserializeOwned>(&self, canonical: &str) -> Result<Option<Cached<V>>> {
        let bytes = match self.local.get(canonical) {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        match self.shared.remote.codec().decode::<V>(&bytes) {
            Ok(cached) => Ok(Some(cached)),
            Err(e) if e.is_corrupt_entry() => {
                warn!("⚠ Dropping unreadable local entry {}:{}: {}", self.name, canonical, e);
                self.local.evict(canonical);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn write<V: Serialize + ?Sized>(
        &self,
        canonical: &str,
        value: Option<&V>,
        ttl: Ttl,
    ) -> Result<()> {
        let remote_expiry = ttl.resolve(self.spec.ttl_remote);
        if remote_expiry == Expiry::Evict || (value.is_none() && !self.spec.allow_null_values) {
            return self.evict_canonical(canonical).await;
        }

        let start = Instant::now();
        let written = self
            .shared
            .remote
            .put(&self.name, canonical, value, remote_expiry, true)
            .await;

        match written {
            Ok(Some(bytes)) => {
                self.local
                    .put_with_expiry(canonical, bytes, ttl.resolve(self.spec.ttl_local));
                self.insert_bloom(canonical);
                self.shared.metrics.record_set(canonical, start.elapsed());
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.shared.metrics.record_error(canonical, &e.to_string());
                Err(e)
            }
        }
    }

    async fn evict_canonical(&self, canonical: &str) -> Result<()> {
        let start = Instant::now();
        let result = self.shared.remote.evict(&self.name, canonical).await;
        self.local.evict(canonical);

        if self.spec.enable_invalidation_notify {
            self.shared
                .bus
                .publish(InvalidationMessage::evict(&self.name, canonical));
            self.schedule_recheck(canonical);
        }

        match result {
            Ok(()) => {
                self.shared.metrics.record_delete(canonical, start.elapsed());
                Ok(())
            }
            Err(e) => {
                self.shared.metrics.record_error(canonical, &e.to_string());
                Err(e)
            }
        }
    }

    /// After `recheck_delay`, force-evict the key again if a racing writer
    /// repopulated L2, and republish the invalidation if configured.
    fn schedule_recheck(&self, canonical: &str) -> JoinHandle<()> {
        let cache = self.clone();
        let key = canonical.to_string();
        let delay = self.shared.config.invalidation.recheck_delay;
        let republish = self.shared.config.invalidation.recheck_republish;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let remote = &cache.shared.remote;

            match remote.exists(&cache.name, &key).await {
                Ok(true) => {
                    warn!(
                        "⚠ {}:{} reappeared in remote after evict, forcing eviction",
                        cache.name, key
                    );
                    if let Err(e) = remote.evict(&cache.name, &key).await {
                        warn!("Forced eviction of {}:{} failed: {}", cache.name, key, e);
                    }
                    cache.local.evict(&key);
                }
                Ok(false) => {}
                Err(e) => warn!("Re-check of {}:{} failed: {}", cache.name, key, e),
            }

            if republish {
                let message = InvalidationMessage::evict(&cache.name, &key);
                if let Err(e) = cache.shared.bus.publish_now(message).await {
                    warn!("⚠ Invalidation republish for {}:{} failed: {}", cache.name, key, e);
                }
            }
        })
    }

    /// Run the loader and write its result through.
    ///
    /// A write-through failure of the remote tier is logged; the value is
    /// still cached locally and returned.
    async fn load_and_store<V, F, Fut>(&self, canonical: &str, loader: F, ttl: Ttl) -> Result<Option<V>>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>>>,
    {
        let loaded = match loader().await {
            Ok(loaded) => loaded,
            Err(e) => {
                self.shared.metrics.record_error(canonical, &e.to_string());
                return Err(e);
            }
        };

        if loaded.is_none() && !self.spec.allow_null_values {
            debug!("Loader found nothing for {}:{}", self.name, canonical);
            return Ok(None);
        }

        let remote_expiry = ttl.resolve(self.spec.ttl_remote);
        if remote_expiry == Expiry::Evict {
            return Ok(loaded);
        }

        let bytes = self.shared.remote.codec().encode(loaded.as_ref())?;
        if let Err(e) = self
            .shared
            .remote
            .put_bytes(&self.name, canonical, bytes.clone(), remote_expiry)
            .await
        {
            warn!(
                "⚠ Write-through of {}:{} failed, cached locally only: {}",
                self.name, canonical, e
            );
            self.shared.metrics.record_error(canonical, &e.to_string());
        }
        self.local
            .put_with_expiry(canonical, bytes, ttl.resolve(self.spec.ttl_local));
        self.insert_bloom(canonical);
        Ok(loaded)
    }

    fn insert_bloom(&self, canonical: &str) {
        if self.bloom_enabled() {
            self.shared
                .bloom
                .put_async(&self.name, canonical.as_bytes().to_vec());
        }
    }
}
