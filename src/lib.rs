//! # tier-cache
//!
//! A two-tier cache: a bounded in-process L1 in front of a shared remote L2,
//! kept coherent across nodes by publish/subscribe invalidation.
//!
//! ## Features
//!
//! - **Two tiers:** sub-millisecond local reads, shared remote store behind them
//! - **O(1) clear:** remote keys are versioned per cache name, so clearing a
//!   cache is a counter increment instead of a key scan
//! - **Penetration guard:** optional per-cache bloom filter, fail-open
//! - **Stampede guard:** concurrent misses of one key collapse into one load,
//!   through a distributed lock with a local fallback
//! - **Coherence:** evict and clear are broadcast to peers, with a delayed
//!   re-check for lost or reordered messages
//! - **Backend Agnostic:** in-memory store and broadcast transport for tests and
//!   single-node setups, Redis for production (`redis` feature)
//!
//! ## Quick Start
//!
//! ```ignore
//! use tier_cache::{
//!     CacheManager, CacheSpecification, StaticSpecificationResolver,
//!     backend::InMemoryStore,
//!     invalidation::LocalBroadcastTransport,
//! };
//! use serde::{Deserialize, Serialize};
//! use std::time::Duration;
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct User {
//!     id: u64,
//!     name: String,
//! }
//!
//! let resolver = StaticSpecificationResolver::new().with_cache(
//!     "users",
//!     CacheSpecification::default()
//!         .with_ttl_local(Duration::from_secs(30))
//!         .with_bloom_filter(true),
//! );
//!
//! let manager = CacheManager::builder(InMemoryStore::new(), LocalBroadcastTransport::new())
//!     .resolver(resolver)
//!     .build()?;
//! manager.start().await?;
//!
//! let users = manager.cache("users")?;
//! let user: Option<User> = users
//!     .get_or_load(&42u64, || async { repository.find_user(42).await })
//!     .await?;
//!
//! users.evict(&42u64).await?; // peers drop their L1 copy too
//! users.clear().await?;       // version bump, nothing deleted
//! ```

#[macro_use]
extern crate log;

pub mod backend;
pub mod bloom;
pub mod config;
pub mod error;
pub mod invalidation;
pub mod key;
pub mod local;
pub mod manager;
pub mod observability;
pub mod remote;
pub mod serialization;
pub mod stampede;
pub mod strategy;
pub mod ttl;

// Re-exports for convenience
pub use backend::RemoteStore;
pub use bloom::BloomFilterManager;
pub use config::{
    BloomFilterConfig, BloomFilterConfigProvider, CacheSpecification,
    CacheSpecificationResolver, StampedeConfig, StaticBloomFilterConfig,
    StaticSpecificationResolver, TieredCacheConfig,
};
pub use error::{Error, Result};
pub use invalidation::{InvalidationBus, InvalidationMessage, InvalidationTransport};
pub use local::LocalCache;
pub use manager::{CacheManager, CacheManagerBuilder, TieredCache};
pub use remote::RemoteCache;
pub use serialization::{Cached, DynamicValue, TypeRegistry};
pub use strategy::CacheStrategy;
pub use ttl::Ttl;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
