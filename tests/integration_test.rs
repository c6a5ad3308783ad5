//! Integration tests for tier-cache
//!
//! Several cache managers share one `InMemoryStore` and one broadcast
//! transport, standing in for processes sharing a Redis instance.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tier_cache::backend::{InMemoryStore, RemoteStore};
use tier_cache::config::InvalidationConfig;
use tier_cache::invalidation::{
    InvalidationBus, InvalidationTransport, LocalBroadcastTransport, Subscription,
};
use tier_cache::local::LocalCacheRegistry;
use tier_cache::observability::CacheMetrics;
use tier_cache::serialization::{type_tag, CacheEnvelope};
use tier_cache::{
    BloomFilterConfig, CacheManager, CacheSpecification, Cached, Error, Result,
    StaticBloomFilterConfig, StaticSpecificationResolver, TieredCacheConfig, Ttl, TypeRegistry,
};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
struct User {
    id: u64,
    name: String,
    email: String,
}

fn user(id: u64) -> User {
    User {
        id,
        name: format!("user-{}", id),
        email: format!("user{}@example.com", id),
    }
}

/// Transport that silently loses the first `drops` publishes.
#[derive(Clone)]
struct LossyTransport {
    inner: LocalBroadcastTransport,
    drops: Arc<AtomicUsize>,
}

impl LossyTransport {
    fn new(drops: usize) -> Self {
        LossyTransport {
            inner: LocalBroadcastTransport::new(),
            drops: Arc::new(AtomicUsize::new(drops)),
        }
    }
}

impl InvalidationTransport for LossyTransport {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        let lost = self
            .drops
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Ok(());
        }
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        self.inner.subscribe(channel).await
    }
}

#[derive(Default)]
struct Recorder {
    resizes: AtomicUsize,
    fallbacks: AtomicUsize,
}

impl CacheMetrics for Recorder {
    fn record_bloom_resize(&self, _cache: &str, _old: u64, _old_expected: u64, _new: u64) {
        self.resizes.fetch_add(1, Ordering::SeqCst);
    }

    fn record_stampede_fallback(&self, _key: &str, _reason: &str) {
        self.fallbacks.fetch_add(1, Ordering::SeqCst);
    }
}

/// Run with `RUST_LOG=debug` to see the cache's traces.
fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .is_test(true)
        .try_init();
}

fn node<P: InvalidationTransport>(
    store: &InMemoryStore,
    transport: &P,
    spec: CacheSpecification,
) -> CacheManager<InMemoryStore, P> {
    init_logging();
    CacheManager::builder(store.clone(), transport.clone())
        .config(TieredCacheConfig::default().with_key_prefix("app"))
        .resolver(StaticSpecificationResolver::new().with_default(spec))
        .build()
        .expect("Failed to build cache manager")
}

async fn started_node<P: InvalidationTransport>(
    store: &InMemoryStore,
    transport: &P,
) -> CacheManager<InMemoryStore, P> {
    let manager = node(store, transport, CacheSpecification::default());
    manager.start().await.expect("Failed to start");
    manager
}

fn in_local<P: InvalidationTransport>(manager: &CacheManager<InMemoryStore, P>, key: &str) -> bool {
    manager
        .local_caches()
        .get("users")
        .is_some_and(|cache| cache.get(key).is_some())
}

async fn eventually<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// ============================================================================
// Versioned clear
// ============================================================================

#[tokio::test]
async fn test_clear_makes_old_version_unreachable() {
    let store = InMemoryStore::new();
    let transport = LocalBroadcastTransport::new();
    let node_a = started_node(&store, &transport).await;
    let node_b = started_node(&store, &transport).await;
    let users_a = node_a.cache("users").unwrap();
    let users_b = node_b.cache("users").unwrap();

    for id in 0..10u64 {
        users_a.put(&id, &user(id)).await.unwrap();
    }
    assert_eq!(users_b.get::<_, User>(&3u64).await.unwrap(), Some(user(3)));

    users_a.clear().await.unwrap();

    for id in 0..10u64 {
        assert_eq!(users_a.get::<_, User>(&id).await.unwrap(), None);
    }
    assert!(eventually(Duration::from_secs(1), || !in_local(&node_b, "3")).await);
    assert_eq!(users_b.get::<_, User>(&3u64).await.unwrap(), None);

    // Nothing was deleted: the old entries are merely unaddressable.
    assert!(store.keys().contains(&"app:users:v1:3".to_string()));
    assert_eq!(node_a.remote().current_version("users").await.unwrap(), 2);

    users_a.put(&3u64, &user(30)).await.unwrap();
    assert_eq!(users_b.get::<_, User>(&3u64).await.unwrap(), Some(user(30)));
}

// ============================================================================
// TTL boundaries
// ============================================================================

#[tokio::test]
async fn test_zero_ttl_is_immediately_absent() {
    let store = InMemoryStore::new();
    let manager = node(&store, &LocalBroadcastTransport::new(), CacheSpecification::default());
    let users = manager.cache("users").unwrap();

    users
        .put_with_ttl(&1u64, &user(1), Ttl::from_millis(0))
        .await
        .unwrap();
    assert_eq!(users.get::<_, User>(&1u64).await.unwrap(), None);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_negative_ttl_never_expires() {
    let spec = CacheSpecification::default()
        .with_ttl_local(Duration::from_millis(50))
        .with_ttl_remote(Duration::from_millis(50));
    let manager = node(&InMemoryStore::new(), &LocalBroadcastTransport::new(), spec);
    let users = manager.cache("users").unwrap();

    users
        .put_with_ttl(&1u64, &user(1), Ttl::from_millis(-1))
        .await
        .unwrap();
    users.put(&2u64, &user(2)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(users.get::<_, User>(&1u64).await.unwrap(), Some(user(1)));
    assert_eq!(users.get::<_, User>(&2u64).await.unwrap(), None);
}

// ============================================================================
// Bloom filter
// ============================================================================

#[tokio::test]
async fn test_bloom_filter_fails_open() {
    let manager = CacheManager::builder(InMemoryStore::new(), LocalBroadcastTransport::new())
        .resolver(
            StaticSpecificationResolver::new()
                .with_default(CacheSpecification::default().with_bloom_filter(true)),
        )
        .build()
        .unwrap();
    let users = manager.cache("users").unwrap();

    assert!(manager.bloom().might_contain("users", b"never-inserted"));
    assert!(users.might_contain(&12345u64).unwrap());
}

#[tokio::test]
async fn test_bloom_negative_never_hides_remote_value() {
    let store = InMemoryStore::new();
    let spec = CacheSpecification::default().with_bloom_filter(true);
    let writer = node(&store, &LocalBroadcastTransport::new(), spec.clone());
    let reader = node(&store, &LocalBroadcastTransport::new(), spec);

    writer.cache("users").unwrap().put(&1u64, &user(1)).await.unwrap();
    let users = reader.cache("users").unwrap();
    // Reader's filter knows about a different key only.
    reader.bloom().put("users", b"2").unwrap();
    assert!(!users.might_contain(&1u64).unwrap());

    assert_eq!(users.get::<_, User>(&1u64).await.unwrap(), Some(user(1)));
}

#[tokio::test]
async fn test_bloom_resize_at_threshold() {
    let recorder = Arc::new(Recorder::default());
    let manager = CacheManager::builder(InMemoryStore::new(), LocalBroadcastTransport::new())
        .resolver(
            StaticSpecificationResolver::new()
                .with_default(CacheSpecification::default().with_bloom_filter(true)),
        )
        .bloom_config(StaticBloomFilterConfig::new(
            BloomFilterConfig::default().with_expected_insertions(100),
        ))
        .metrics(recorder.clone())
        .build()
        .unwrap();
    let bloom = manager.bloom();

    for i in 0..90u32 {
        bloom.put("users", format!("before-{}", i).as_bytes()).unwrap();
    }
    assert_eq!(recorder.resizes.load(Ordering::SeqCst), 1);
    assert_eq!(bloom.stats("users").unwrap().expected_insertions, 200);

    // Membership from before the resize is (mostly) gone.
    let lost = (0..89u32)
        .filter(|i| !bloom.might_contain("users", format!("before-{}", i).as_bytes()))
        .count();
    assert!(lost > 0);

    for i in 0..50u32 {
        let key = format!("after-{}", i);
        bloom.put("users", key.as_bytes()).unwrap();
        assert!(bloom.might_contain("users", key.as_bytes()));
    }
    assert_eq!(recorder.resizes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_bloom_resize_through_cache_writes() {
    let recorder = Arc::new(Recorder::default());
    let manager = CacheManager::builder(InMemoryStore::new(), LocalBroadcastTransport::new())
        .resolver(
            StaticSpecificationResolver::new()
                .with_default(CacheSpecification::default().with_bloom_filter(true)),
        )
        .bloom_config(StaticBloomFilterConfig::new(
            BloomFilterConfig::default().with_expected_insertions(100),
        ))
        .metrics(recorder.clone())
        .build()
        .unwrap();
    let users = manager.cache("users").unwrap();

    for id in 0..90u64 {
        users.put(&id, &user(id)).await.unwrap();
    }
    assert!(
        eventually(Duration::from_secs(1), || {
            recorder.resizes.load(Ordering::SeqCst) == 1
                && users.bloom_stats().map(|s| s.current_insertions) == Some(1)
        })
        .await
    );
}

// ============================================================================
// Stampede protection
// ============================================================================

#[tokio::test]
async fn test_concurrent_misses_load_once() {
    let store = InMemoryStore::new();
    let transport = LocalBroadcastTransport::new();
    let node_a = node(&store, &transport, CacheSpecification::default());
    let node_b = node(&store, &transport, CacheSpecification::default());
    let loads = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for i in 0..16 {
        let users = if i % 2 == 0 {
            node_a.cache("users").unwrap()
        } else {
            node_b.cache("users").unwrap()
        };
        let loads = Arc::clone(&loads);
        tasks.push(tokio::spawn(async move {
            users
                .get_or_load(&7u64, move || async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(Some(user(7)))
                })
                .await
        }));
    }

    for task in tasks {
        let value = task.await.expect("task panicked").unwrap();
        assert_eq!(value, Some(user(7)));
    }
    assert_eq!(loads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_lock_wait_expiry_falls_back_to_load() {
    let store = InMemoryStore::new();
    let recorder = Arc::new(Recorder::default());
    let config = TieredCacheConfig::default().with_key_prefix("app").with_stampede(
        tier_cache::StampedeConfig::default().with_lock_wait(Duration::from_millis(50)),
    );
    let manager = CacheManager::builder(store.clone(), LocalBroadcastTransport::new())
        .config(config)
        .metrics(recorder.clone())
        .build()
        .unwrap();

    // A crashed holder: lock taken and never released.
    store
        .try_lock("app:lock:users:7", "crashed", Duration::from_secs(30))
        .await
        .unwrap();

    let value = manager
        .cache("users")
        .unwrap()
        .get_or_load(&7u64, || async { Ok(Some(user(7))) })
        .await
        .unwrap();
    assert_eq!(value, Some(user(7)));
    assert_eq!(recorder.fallbacks.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Invalidation
// ============================================================================

#[tokio::test]
async fn test_evict_propagates_to_peer_l1() {
    let store = InMemoryStore::new();
    let transport = LocalBroadcastTransport::new();
    let node_a = started_node(&store, &transport).await;
    let node_b = started_node(&store, &transport).await;

    node_a.cache("users").unwrap().put(&1u64, &user(1)).await.unwrap();
    let users_b = node_b.cache("users").unwrap();
    assert_eq!(users_b.get::<_, User>(&1u64).await.unwrap(), Some(user(1)));
    assert!(in_local(&node_b, "1"));

    node_a.cache("users").unwrap().evict(&1u64).await.unwrap();

    assert!(eventually(Duration::from_secs(1), || !in_local(&node_b, "1")).await);
    assert_eq!(users_b.get::<_, User>(&1u64).await.unwrap(), None);
}

#[tokio::test]
async fn test_put_does_not_invalidate_peers() {
    let store = InMemoryStore::new();
    let transport = LocalBroadcastTransport::new();
    let node_a = started_node(&store, &transport).await;
    let node_b = started_node(&store, &transport).await;

    node_a.cache("users").unwrap().put(&1u64, &user(1)).await.unwrap();
    node_b.cache("users").unwrap().get::<_, User>(&1u64).await.unwrap();

    node_a.cache("users").unwrap().put(&1u64, &user(2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(in_local(&node_b, "1"));
    assert_eq!(node_b.invalidation_stats().applied, 0);
}

#[tokio::test]
async fn test_lost_invalidation_recovered_by_recheck() {
    let store = InMemoryStore::new();
    let transport = LossyTransport::new(1);
    let node_a = started_node(&store, &transport).await;
    let node_b = started_node(&store, &transport).await;

    node_a.cache("users").unwrap().put(&1u64, &user(1)).await.unwrap();
    node_b.cache("users").unwrap().get::<_, User>(&1u64).await.unwrap();
    assert!(in_local(&node_b, "1"));

    node_a.cache("users").unwrap().evict(&1u64).await.unwrap();

    assert!(eventually(Duration::from_secs(2), || !in_local(&node_b, "1")).await);
    assert_eq!(transport.drops.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_recheck_removes_racing_write() {
    let store = InMemoryStore::new();
    let transport = LocalBroadcastTransport::new();
    let manager = CacheManager::builder(store.clone(), transport)
        .config(
            TieredCacheConfig::default()
                .with_key_prefix("app")
                .with_invalidation(InvalidationConfig {
                    recheck_delay: Duration::from_millis(50),
                    ..InvalidationConfig::default()
                }),
        )
        .build()
        .unwrap();
    let users = manager.cache("users").unwrap();

    users.put(&1u64, &user(1)).await.unwrap();
    users.evict(&1u64).await.unwrap();
    // A racing writer repopulates L2 behind the eviction.
    store
        .set("app:users:v1:1", b"stale".to_vec(), None)
        .await
        .unwrap();

    assert!(
        eventually(Duration::from_secs(1), || {
            !store.keys().contains(&"app:users:v1:1".to_string())
        })
        .await
    );
}

#[tokio::test]
async fn test_bus_subscribe_guards() {
    let bus = InvalidationBus::new(
        LocalBroadcastTransport::new(),
        "tier-cache:invalidation",
        "node-a",
        LocalCacheRegistry::new(),
    );

    bus.unsubscribe().await;
    assert!(!bus.is_subscribed().await);

    bus.subscribe().await.unwrap();
    assert!(matches!(bus.subscribe().await, Err(Error::IllegalState(_))));

    bus.unsubscribe().await;
    bus.unsubscribe().await;
    assert!(!bus.is_subscribed().await);
}

// ============================================================================
// Null values, types and degraded operation
// ============================================================================

#[tokio::test]
async fn test_cached_null_stops_penetration() {
    let spec = CacheSpecification::default().with_null_values(true);
    let manager = node(&InMemoryStore::new(), &LocalBroadcastTransport::new(), spec);
    let users = manager.cache("users").unwrap();
    let loads = AtomicUsize::new(0);

    for _ in 0..5 {
        let value = users
            .get_or_load::<_, User, _, _>(&404u64, || async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .await
            .unwrap();
        assert!(value.is_none());
    }
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!(
        users.lookup::<_, User>(&404u64).await.unwrap(),
        Some(Cached::Null)
    );
}

#[tokio::test]
async fn test_type_mismatch_is_loud() {
    let manager = node(
        &InMemoryStore::new(),
        &LocalBroadcastTransport::new(),
        CacheSpecification::default(),
    );
    let users = manager.cache("users").unwrap();
    users.put(&1u64, &user(1)).await.unwrap();

    let result = users.get::<_, Vec<String>>(&1u64).await;
    assert!(matches!(result, Err(Error::TypeMismatch { .. })));
}

#[tokio::test]
async fn test_renamed_type_resolved_through_alias() {
    let store = InMemoryStore::new();
    let registry = Arc::new(TypeRegistry::new());
    registry.alias("legacy::model::User", type_tag::<User>());

    let manager = CacheManager::builder(store.clone(), LocalBroadcastTransport::new())
        .config(TieredCacheConfig::default().with_key_prefix("app"))
        .type_registry(registry)
        .build()
        .unwrap();

    let payload = serde_json::to_vec(&user(1)).unwrap();
    let bytes = CacheEnvelope::new("legacy::model::User", payload)
        .to_bytes()
        .unwrap();
    store.set("app:users:v1:1", bytes, None).await.unwrap();

    let users = manager.cache("users").unwrap();
    assert_eq!(users.get::<_, User>(&1u64).await.unwrap(), Some(user(1)));
}

#[tokio::test]
async fn test_unknown_type_reads_dynamically() {
    let store = InMemoryStore::new();
    let manager = node(&store, &LocalBroadcastTransport::new(), CacheSpecification::default());

    let bytes = CacheEnvelope::new("other::service::Thing", br#"{"x":1}"#.to_vec())
        .to_bytes()
        .unwrap();
    store.set("app:users:v1:9", bytes, None).await.unwrap();

    let dynamic = manager
        .cache("users")
        .unwrap()
        .get_dynamic(&9u64)
        .await
        .unwrap()
        .unwrap();
    assert!(!dynamic.resolved);
    assert_eq!(dynamic.type_tag, "other::service::Thing");
    assert_eq!(dynamic.value["x"], 1);
}

#[tokio::test]
async fn test_corrupt_remote_entry_is_a_miss() {
    let store = InMemoryStore::new();
    let manager = node(&store, &LocalBroadcastTransport::new(), CacheSpecification::default());
    store
        .set("app:users:v1:1", b"not an envelope".to_vec(), None)
        .await
        .unwrap();

    let users = manager.cache("users").unwrap();
    assert_eq!(users.get::<_, User>(&1u64).await.unwrap(), None);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_store_outage_degrades() {
    let store = InMemoryStore::new();
    let manager = node(&store, &LocalBroadcastTransport::new(), CacheSpecification::default());
    let users = manager.cache("users").unwrap();
    users.put(&1u64, &user(1)).await.unwrap();

    store.set_unavailable(true);

    // L1 hits keep working.
    assert_eq!(users.get::<_, User>(&1u64).await.unwrap(), Some(user(1)));

    // Loads still succeed through the local lock and are cached locally.
    let loaded = users
        .get_or_load(&2u64, || async { Ok(Some(user(2))) })
        .await
        .unwrap();
    assert_eq!(loaded, Some(user(2)));
    assert_eq!(users.get::<_, User>(&2u64).await.unwrap(), Some(user(2)));

    // Plain reads that need the remote tier surface the failure.
    assert!(matches!(
        users.get::<_, User>(&3u64).await,
        Err(Error::BackendError(_))
    ));

    // Writes fail, but L1 is still evicted.
    assert!(users.evict(&1u64).await.is_err());
    store.set_unavailable(false);
    assert!(manager.local_caches().get("users").unwrap().get("1").is_none());
}

#[tokio::test]
async fn test_batch_operations_across_nodes() {
    let store = InMemoryStore::new();
    let transport = LocalBroadcastTransport::new();
    let node_a = node(&store, &transport, CacheSpecification::default());
    let node_b = node(&store, &transport, CacheSpecification::default());

    let entries: Vec<(u64, User)> = (1..=5).map(|id| (id, user(id))).collect();
    node_a.cache("users").unwrap().put_all(&entries).await.unwrap();

    let found = node_b
        .cache("users")
        .unwrap()
        .get_all::<_, User>(&[1u64, 3, 5, 7])
        .await
        .unwrap();
    assert_eq!(found.len(), 3);
    assert_eq!(found.get("5"), Some(&user(5)));
    assert!(in_local(&node_b, "3"));
}
