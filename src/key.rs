//! Cache key management utilities.
//!
//! Every key object is reduced to a canonical string before it touches any
//! tier. The remote cache, the local cache and the bloom filter all use the
//! same [`canonical_key`] output, so they never disagree about identity: two
//! different objects that serialize to the same canonical form address the
//! same cache entry.

use crate::error::{Error, Result};
use serde::Serialize;
use serde_json::Value;

/// Separator between key segments.
pub const KEY_SEPARATOR: &str = ":";

/// Suffix of the per-cache version counter key.
const VERSION_SUFFIX: &str = "__version__";

/// Namespace segment used for stampede lock keys.
const LOCK_SEGMENT: &str = "lock";

/// Reduce a key object to its canonical string form.
///
/// - Strings are used verbatim.
/// - Numbers are used verbatim (`42` → `"42"`).
/// - Everything else is rendered as compact JSON with object keys sorted, so
///   the output does not depend on field or insertion order.
///
/// # Errors
///
/// Returns `Error::SerializationError` if the key cannot be represented as
/// JSON (for example a map with non-string keys).
pub fn canonical_key<K: Serialize + ?Sized>(key: &K) -> Result<String> {
    let value = serde_json::to_value(key)
        .map_err(|e| Error::SerializationError(format!("Key serialization failed: {}", e)))?;

    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => serde_json::to_string(&other)
            .map_err(|e| Error::SerializationError(format!("Key serialization failed: {}", e))),
    }
}

/// Canonical key of a cache entry.
///
/// Blank keys are refused: peers drop invalidations for them, so an entry
/// under one could never be evicted remotely.
///
/// # Errors
///
/// - `Error::SerializationError` as for [`canonical_key`]
/// - `Error::IllegalState` if the canonical key is empty or whitespace
pub fn entry_key<K: Serialize + ?Sized>(key: &K) -> Result<String> {
    let canonical = canonical_key(key)?;
    if canonical.trim().is_empty() {
        return Err(Error::IllegalState(format!(
            "Blank cache key {:?}",
            canonical
        )));
    }
    Ok(canonical)
}

/// Builder for remote cache keys.
pub struct CacheKeyBuilder;

impl CacheKeyBuilder {
    /// Build a full key from prefix, namespace and canonical key.
    ///
    /// Empty segments are skipped, so an empty prefix does not produce a
    /// leading separator.
    pub fn build(prefix: &str, namespace: &str, key: &str) -> String {
        Self::build_composite(&[prefix, namespace, key])
    }

    /// Effective namespace of a cache name at a given version: `"{name}:v{version}"`.
    pub fn versioned_namespace(cache_name: &str, version: i64) -> String {
        format!("{}{}v{}", cache_name, KEY_SEPARATOR, version)
    }

    /// Key holding the version counter of a cache name.
    pub fn version_key(prefix: &str, cache_name: &str) -> String {
        Self::build(prefix, cache_name, VERSION_SUFFIX)
    }

    /// Key of the stampede lock for one entry of a cache name.
    pub fn lock_key(prefix: &str, cache_name: &str, key: &str) -> String {
        Self::build_composite(&[prefix, LOCK_SEGMENT, cache_name, key])
    }

    /// Build composite key from multiple parts, skipping empty parts.
    pub fn build_composite(parts: &[&str]) -> String {
        parts
            .iter()
            .filter(|p| !p.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(KEY_SEPARATOR)
    }
}
