//! Performance benchmarks for tier-cache
//!
//! This benchmark suite measures:
//! - L1 local cache operations
//! - Tiered reads (L1 hit, L2 hit with back-fill, read-through load)
//! - Bloom filter insert and lookup
//! - Value envelope encode/decode across payload sizes
//!
//! Run with: cargo bench
//! View results: open target/criterion/report/index.html

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde::{Deserialize, Serialize};
use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tier_cache::backend::InMemoryStore;
use tier_cache::bloom::BloomFilter;
use tier_cache::invalidation::LocalBroadcastTransport;
use tier_cache::local::LocalCache;
use tier_cache::serialization::ValueCodec;
use tier_cache::{
    BloomFilterConfig, CacheManager, CacheSpecification, CacheStrategy, StaticBloomFilterConfig,
    StaticSpecificationResolver, Ttl,
};

// ============================================================================
// Benchmark Fixtures
// ============================================================================

/// Benchmark value with configurable data size
#[derive(Clone, Serialize, Deserialize)]
struct BenchValue {
    id: u64,
    data: Vec<u8>,
}

impl BenchValue {
    fn new(id: u64, size: usize) -> Self {
        BenchValue {
            id,
            data: vec![0u8; size],
        }
    }
}

type BenchManager = CacheManager<InMemoryStore, LocalBroadcastTransport>;

fn bench_manager(bloom: bool) -> BenchManager {
    CacheManager::builder(InMemoryStore::new(), LocalBroadcastTransport::new())
        .resolver(StaticSpecificationResolver::new().with_default(
            CacheSpecification::default()
                .with_local_max_size(100_000)
                .with_bloom_filter(bloom),
        ))
        .bloom_config(StaticBloomFilterConfig::new(
            BloomFilterConfig::default().with_expected_insertions(10_000_000),
        ))
        .build()
        .expect("Failed to build cache manager")
}

// ============================================================================
// Group 1: L1 Benchmarks
// ============================================================================

fn local_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_cache");

    for size in [100, 1_000, 10_000].iter() {
        group
            .throughput(Throughput::Bytes(*size as u64))
            .bench_with_input(BenchmarkId::new("put", size), size, |b, &size| {
                let cache = LocalCache::new("bench", 10_000, Duration::from_secs(60))
                    .expect("Failed to create local cache");
                let value = vec![1u8; size];

                b.iter(|| cache.put(black_box("key"), value.clone(), Ttl::Default));
            });

        group
            .throughput(Throughput::Bytes(*size as u64))
            .bench_with_input(BenchmarkId::new("get_hit", size), size, |b, &size| {
                let cache = LocalCache::new("bench", 10_000, Duration::from_secs(60))
                    .expect("Failed to create local cache");
                cache.put("key", vec![1u8; size], Ttl::Default);

                b.iter(|| cache.get(black_box("key")));
            });
    }

    // Capacity eviction on every insert
    group.bench_function("put_at_capacity", |b| {
        let cache = LocalCache::new("bench", 1_000, Duration::from_secs(60))
            .expect("Failed to create local cache");
        let mut i = 0u64;

        b.iter(|| {
            i += 1;
            cache.put(&i.to_string(), vec![1u8; 100], Ttl::Default);
        });
    });

    group.finish();
}

// ============================================================================
// Group 2: Tiered Cache Benchmarks
// ============================================================================

fn tiered_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("tiered_cache");

    // Create tokio runtime for async operations
    let rt = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");

    for size in [100, 1_000, 10_000].iter() {
        // Measures: L1 lookup + decode
        group
            .throughput(Throughput::Bytes(*size as u64))
            .bench_with_input(BenchmarkId::new("get_l1_hit", size), size, |b, &size| {
                let manager = bench_manager(false);
                let cache = manager.cache("bench").expect("Failed to create cache");
                rt.block_on(async {
                    cache
                        .put(&1u64, &BenchValue::new(1, size))
                        .await
                        .expect("Failed to populate cache");
                });

                b.to_async(&rt)
                    .iter(|| async { cache.get::<_, BenchValue>(black_box(&1u64)).await });
            });

        // Measures: L1 miss + version read + L2 read + decode + back-fill
        group
            .throughput(Throughput::Bytes(*size as u64))
            .bench_with_input(BenchmarkId::new("get_l2_hit", size), size, |b, &size| {
                let manager = bench_manager(false);
                let cache = manager.cache("bench").expect("Failed to create cache");
                let local = manager
                    .local_caches()
                    .get("bench")
                    .expect("Local cache missing");
                rt.block_on(async {
                    cache
                        .put(&1u64, &BenchValue::new(1, size))
                        .await
                        .expect("Failed to populate cache");
                });

                b.to_async(&rt).iter(|| {
                    local.clear();
                    let cache = cache.clone();
                    async move { cache.get::<_, BenchValue>(black_box(&1u64)).await }
                });
            });
    }

    // Measures: miss in both tiers + lock + load + write-through
    group.bench_function("get_or_load_miss", |b| {
        let manager = bench_manager(true);
        let cache = manager.cache("bench").expect("Failed to create cache");
        let counter = Arc::new(AtomicU64::new(0));

        b.to_async(&rt).iter(|| {
            let cache = cache.clone();
            let key = counter.fetch_add(1, Ordering::Relaxed);
            async move {
                cache
                    .get_or_load(black_box(&key), move || async move {
                        Ok(Some(BenchValue::new(key, 1_000)))
                    })
                    .await
            }
        });
    });

    // Bypass strategy
    // Measures: load + write-through (skip cache read)
    group.bench_function("fetch_bypass", |b| {
        let manager = bench_manager(false);
        let cache = manager.cache("bench").expect("Failed to create cache");

        b.to_async(&rt).iter(|| async {
            cache
                .fetch(black_box(&1u64), black_box(CacheStrategy::Bypass), || async {
                    Ok(Some(BenchValue::new(1, 1_000)))
                })
                .await
        });
    });

    group.finish();
}

// ============================================================================
// Group 3: Bloom Filter Benchmarks
// ============================================================================

fn bloom_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("bloom_filter");

    group.bench_function("insert", |b| {
        let mut filter = BloomFilter::new(1_000_000, 0.01);
        let mut i = 0u64;

        b.iter(|| {
            i += 1;
            filter.insert(black_box(&i.to_le_bytes()))
        });
    });

    group.bench_function("might_contain", |b| {
        let mut filter = BloomFilter::new(1_000_000, 0.01);
        for i in 0..100_000u64 {
            filter.insert(&i.to_le_bytes());
        }
        let lookups: Vec<u64> = (0..1_000).map(|_| rand::random::<u64>() % 200_000).collect();
        let mut n = 0usize;

        b.iter(|| {
            n = (n + 1) % lookups.len();
            filter.might_contain(black_box(&lookups[n].to_le_bytes()))
        });
    });

    group.finish();
}

// ============================================================================
// Group 4: Serialization Benchmarks
// ============================================================================

fn serialization_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialization");
    let codec = ValueCodec::default();

    for size in [100, 1_000, 10_000, 100_000].iter() {
        let value = BenchValue::new(1, *size);

        // Encode (JSON payload inside a Postcard envelope)
        group
            .throughput(Throughput::Bytes(*size as u64))
            .bench_with_input(BenchmarkId::new("encode", size), &value, |b, value| {
                b.iter(|| codec.encode(Some(black_box(value))));
            });

        let encoded = codec.encode(Some(&value)).expect("Failed to encode");
        group
            .throughput(Throughput::Bytes(*size as u64))
            .bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, encoded| {
                b.iter(|| codec.decode::<BenchValue>(black_box(encoded)));
            });
    }

    group.finish();
}

// ============================================================================
// Benchmark Registration
// ============================================================================

criterion_group!(
    benches,
    local_benchmarks,
    tiered_benchmarks,
    bloom_benchmarks,
    serialization_benchmarks
);
criterion_main!(benches);
