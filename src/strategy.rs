//! Fetch strategies for [`crate::TieredCache::fetch`].
//!
//! # The Four Strategies
//!
//! ```
//! use tier_cache::strategy::CacheStrategy;
//!
//! // 1. Fresh - tiers only, never the loader
//! let _s = CacheStrategy::Fresh;
//!
//! // 2. Refresh - tiers first, single-flight load on miss (default)
//! let _s = CacheStrategy::Refresh;
//!
//! // 3. Invalidate - evict everywhere, then load
//! let _s = CacheStrategy::Invalidate;
//!
//! // 4. Bypass - always load, write the result through
//! let _s = CacheStrategy::Bypass;
//! ```
//!
//! | Strategy | Cache Hit | Cache Miss | Use Case |
//! |----------|-----------|-----------|----------|
//! | **Fresh** | Return | Return None | Value must already be cached |
//! | **Refresh** | Return | Load + store | Default read-through |
//! | **Invalidate** | Evict + load | Load + store | After a mutation of the source |
//! | **Bypass** | Ignored | Load + store | Forced recompute |
//!
//! Invalidate goes through the regular evict path, so peers drop their L1
//! copy as well.

/// Strategy controlling how a fetch uses the tiers and the loader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CacheStrategy {
    /// Read L1/L2 only. A miss returns `None` without calling the loader.
    Fresh,

    /// Read L1/L2; on a miss, load under the stampede guard and store.
    #[default]
    Refresh,

    /// Evict the key (both tiers, peers notified), then load and store.
    Invalidate,

    /// Call the loader unconditionally and write the result through.
    Bypass,
}

impl std::fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheStrategy::Fresh => write!(f, "Fresh"),
            CacheStrategy::Refresh => write!(f, "Refresh"),
            CacheStrategy::Invalidate => write!(f, "Invalidate"),
            CacheStrategy::Bypass => write!(f, "Bypass"),
        }
    }
}
