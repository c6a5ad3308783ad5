//! Redis Backend Integration Tests
//!
//! These tests require a running Redis instance and skip themselves when none
//! is reachable.
//!
//! ## Quick Start
//!
//! ```bash
//! docker run -d -p 6379:6379 redis:7
//! cargo test --features redis --test redis_integration_test
//! ```
//!
//! ## Environment Variables
//!
//! - `TEST_REDIS_URL`: Redis connection URL (default: "redis://localhost:6379")
//!
//! ## What's Tested
//!
//! 1. Store commands: set/get with TTL, counters, batches, locks
//! 2. Pub/sub transport delivery
//! 3. Two cache managers sharing one Redis: read-through, evict, clear
//! 4. Single-flight loading across managers

#![cfg(feature = "redis")]

use serde::{Deserialize, Serialize};
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tier_cache::backend::{RedisBackend, RemoteStore};
use tier_cache::invalidation::InvalidationTransport;
use tier_cache::{CacheManager, TieredCacheConfig};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Account {
    id: u64,
    owner: String,
}

/// Helper: Get Redis connection URL from environment or use default
fn get_redis_url() -> String {
    env::var("TEST_REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

/// Helper: Connect, or `None` when Redis is not reachable.
async fn connect() -> Option<RedisBackend> {
    let backend = RedisBackend::from_connection_string(&get_redis_url())
        .await
        .ok()?;
    if backend.health_check().await.unwrap_or(false) {
        Some(backend)
    } else {
        println!("Redis not reachable at {}, skipping", get_redis_url());
        None
    }
}

/// Unique key prefix per test run, so runs never see each other's data.
fn unique_prefix() -> String {
    format!("tier-test-{}", Uuid::now_v7())
}

fn manager(backend: &RedisBackend, prefix: &str) -> CacheManager<RedisBackend, RedisBackend> {
    CacheManager::builder(backend.clone(), backend.clone())
        .config(TieredCacheConfig::default().with_key_prefix(prefix))
        .build()
        .expect("Failed to build cache manager")
}

#[tokio::test]
async fn test_redis_set_get_with_ttl() {
    let Some(backend) = connect().await else {
        return;
    };
    let key = format!("{}:ttl", unique_prefix());

    backend
        .set(&key, b"value".to_vec(), Some(Duration::from_millis(300)))
        .await
        .unwrap();
    assert_eq!(backend.get(&key).await.unwrap(), Some(b"value".to_vec()));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(backend.get(&key).await.unwrap(), None);
}

#[tokio::test]
async fn test_redis_counter_and_batches() {
    let Some(backend) = connect().await else {
        return;
    };
    let prefix = unique_prefix();
    let counter = format!("{}:counter", prefix);

    assert_eq!(backend.get_counter(&counter).await.unwrap(), None);
    assert_eq!(backend.incr(&counter).await.unwrap(), 1);
    assert_eq!(backend.incr(&counter).await.unwrap(), 2);
    assert_eq!(backend.get_counter(&counter).await.unwrap(), Some(2));

    let entries: Vec<(String, Vec<u8>)> = (0..5)
        .map(|i| (format!("{}:batch:{}", prefix, i), vec![i as u8]))
        .collect();
    backend
        .mset(entries.clone(), Some(Duration::from_secs(60)))
        .await
        .unwrap();

    let mut keys: Vec<String> = entries.iter().map(|(k, _)| k.clone()).collect();
    keys.push(format!("{}:batch:missing", prefix));
    let values = backend.mget(&keys).await.unwrap();
    assert_eq!(values.len(), 6);
    assert_eq!(values[2], Some(vec![2u8]));
    assert_eq!(values[5], None);

    for key in keys.iter().chain(std::iter::once(&counter)) {
        backend.delete(key).await.unwrap();
    }
}

#[tokio::test]
async fn test_redis_mget_wrong_type_is_a_miss() {
    let Some(backend) = connect().await else {
        return;
    };
    let prefix = unique_prefix();
    let plain = format!("{}:plain", prefix);
    let hash = format!("{}:hash", prefix);

    backend.set(&plain, b"value".to_vec(), None).await.unwrap();
    let client = redis::Client::open(get_redis_url()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    redis::cmd("HSET")
        .arg(&hash)
        .arg("field")
        .arg("value")
        .query_async::<()>(&mut conn)
        .await
        .unwrap();

    // GET on a hash is a WRONGTYPE reply; only that slot misses.
    let values = backend.mget(&[hash.clone(), plain.clone()]).await.unwrap();
    assert_eq!(values, vec![None, Some(b"value".to_vec())]);

    backend.delete(&plain).await.unwrap();
    backend.delete(&hash).await.unwrap();
}

#[tokio::test]
async fn test_redis_incr_at_least_and_huge_ttl() {
    let Some(backend) = connect().await else {
        return;
    };
    let prefix = unique_prefix();
    let counter = format!("{}:version", prefix);

    backend.set(&counter, b"-3".to_vec(), None).await.unwrap();
    assert_eq!(backend.incr_at_least(&counter, 2).await.unwrap(), 2);
    assert_eq!(backend.incr_at_least(&counter, 2).await.unwrap(), 3);
    assert_eq!(backend.get_counter(&counter).await.unwrap(), Some(3));

    let forever = format!("{}:forever", prefix);
    backend
        .set(&forever, b"x".to_vec(), Some(Duration::MAX))
        .await
        .unwrap();
    assert_eq!(backend.get(&forever).await.unwrap(), Some(b"x".to_vec()));

    backend.delete(&counter).await.unwrap();
    backend.delete(&forever).await.unwrap();
}

#[tokio::test]
async fn test_redis_lock_ownership() {
    let Some(backend) = connect().await else {
        return;
    };
    let lock = format!("{}:lock", unique_prefix());

    assert!(backend.try_lock(&lock, "a", Duration::from_secs(5)).await.unwrap());
    assert!(!backend.try_lock(&lock, "b", Duration::from_secs(5)).await.unwrap());

    // Only the holder's token releases it.
    backend.unlock(&lock, "b").await.unwrap();
    assert!(!backend.try_lock(&lock, "b", Duration::from_secs(5)).await.unwrap());

    backend.unlock(&lock, "a").await.unwrap();
    assert!(backend.try_lock(&lock, "b", Duration::from_secs(5)).await.unwrap());
    backend.unlock(&lock, "b").await.unwrap();
}

#[tokio::test]
async fn test_redis_pubsub_delivery() {
    let Some(backend) = connect().await else {
        return;
    };
    let channel = format!("{}:channel", unique_prefix());

    let mut subscription = backend.subscribe(&channel).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    backend.publish(&channel, b"hello".to_vec()).await.unwrap();
    let received = tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .expect("no message within timeout");
    assert_eq!(received, Some(b"hello".to_vec()));
}

#[tokio::test]
async fn test_redis_two_managers_stay_coherent() {
    let Some(backend) = connect().await else {
        return;
    };
    let prefix = unique_prefix();
    let node_a = manager(&backend, &prefix);
    let node_b = manager(&backend, &prefix);
    node_a.start().await.unwrap();
    node_b.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let accounts_a = node_a.cache("accounts").unwrap();
    let accounts_b = node_b.cache("accounts").unwrap();
    let account = Account {
        id: 1,
        owner: "alice".to_string(),
    };

    accounts_a.put(&1u64, &account).await.unwrap();
    assert_eq!(
        accounts_b.get::<_, Account>(&1u64).await.unwrap(),
        Some(account.clone())
    );

    accounts_a.evict(&1u64).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(node_b
        .local_caches()
        .get("accounts")
        .is_some_and(|l1| l1.get("1").is_none()));
    assert_eq!(accounts_b.get::<_, Account>(&1u64).await.unwrap(), None);

    accounts_a.put(&2u64, &account).await.unwrap();
    accounts_b.get::<_, Account>(&2u64).await.unwrap();
    accounts_a.clear().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(accounts_b.get::<_, Account>(&2u64).await.unwrap(), None);

    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[tokio::test]
async fn test_redis_single_flight_across_managers() {
    let Some(backend) = connect().await else {
        return;
    };
    let prefix = unique_prefix();
    let managers = [manager(&backend, &prefix), manager(&backend, &prefix)];
    let loads = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for i in 0..10 {
        let accounts = managers[i % 2].cache("accounts").unwrap();
        let loads = Arc::clone(&loads);
        tasks.push(tokio::spawn(async move {
            accounts
                .get_or_load(&9u64, move || async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(Some(Account {
                        id: 9,
                        owner: "bob".to_string(),
                    }))
                })
                .await
        }));
    }

    for result in futures::future::join_all(tasks).await {
        let account = result.expect("task panicked").unwrap();
        assert_eq!(account.map(|a| a.owner), Some("bob".to_string()));
    }
    assert_eq!(loads.load(Ordering::SeqCst), 1);
}
