//! Versioned, type-tagged envelopes for cached values.
//!
//! Every value stored in either tier is wrapped in an envelope:
//!
//! ```text
//! ┌─────────────────┬─────────────────┬──────────────────┬────────────────────┐
//! │  MAGIC (4 bytes)│VERSION (varint) │ TYPE TAG (string)│ PAYLOAD (JSON)     │
//! └─────────────────┴─────────────────┴──────────────────┴────────────────────┘
//!   "TIER"            u32                type_name::<V>()   serde_json::to_vec
//! ```
//!
//! The envelope frame is Postcard-encoded. The payload is JSON because it has
//! to stay readable as a generic structural value when its type tag cannot be
//! resolved (see [`DynamicValue`]).
//!
//! # Type safety
//!
//! A typed read checks the stored tag, after following the alias chain in
//! [`TypeRegistry`], against the tag of the requested type. A mismatch is an
//! [`Error::TypeMismatch`], never a silently wrong value.
//!
//! # Example
//!
//! ```rust
//! use tier_cache::serialization::{Cached, ValueCodec};
//!
//! # fn main() -> tier_cache::Result<()> {
//! let codec = ValueCodec::default();
//! let bytes = codec.encode(Some(&42u64))?;
//! assert_eq!(codec.decode::<u64>(&bytes)?, Cached::Value(42));
//! assert!(codec.decode::<String>(&bytes).is_err());
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::type_name;
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Magic header for tier-cache entries: b"TIER"
pub const CACHE_MAGIC: [u8; 4] = *b"TIER";

/// Current envelope schema version.
///
/// Entries written under a different version are treated as corrupt: evicted
/// and recomputed from the source of truth.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Type tag of a cached "no value" marker.
pub const NULL_TYPE_TAG: &str = "null";

/// Longest alias chain followed before giving up (guards against cycles).
const MAX_ALIAS_HOPS: usize = 16;

/// Path prefix of `Vec`, as rendered by `type_name`.
const VEC_PATH: &str = "alloc::vec::Vec";

/// Type tag of a Rust type.
///
/// Borrowed and unsized forms carry the tag of their owned counterpart: a
/// value written as `&T`, `str` or `[T]` reads back as `T`, `String` or
/// `Vec<T>`. Tags come from [`std::any::type_name`], whose output is not
/// guaranteed across compiler releases; bridge a changed tag with
/// [`TypeRegistry::alias`].
pub fn type_tag<V: ?Sized>() -> Cow<'static, str> {
    owned_tag(std::any::type_name::<V>())
}

fn owned_tag(name: &'static str) -> Cow<'static, str> {
    let mut name = name;
    while let Some(rest) = name
        .strip_prefix("&mut ")
        .or_else(|| name.strip_prefix('&'))
    {
        name = rest;
    }

    if name == "str" {
        return Cow::Borrowed(type_name::<String>());
    }
    if let Some(element) = name.strip_prefix('[').and_then(|n| n.strip_suffix(']')) {
        // `[T; N]` arrays keep their own tag.
        if !has_top_level_semicolon(element) {
            return Cow::Owned(format!("{}<{}>", VEC_PATH, owned_tag(element)));
        }
    }
    Cow::Borrowed(name)
}

fn has_top_level_semicolon(name: &str) -> bool {
    let mut depth = 0usize;
    for c in name.chars() {
        match c {
            '[' | '<' | '(' => depth += 1,
            ']' | '>' | ')' => depth = depth.saturating_sub(1),
            ';' if depth == 0 => return true,
            _ => {}
        }
    }
    false
}

/// Envelope frame around every cached value.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CacheEnvelope {
    /// Magic header: must be b"TIER"
    pub magic: [u8; 4],
    /// Schema version: must match CURRENT_SCHEMA_VERSION
    pub version: u32,
    /// Type tag of the payload
    pub type_tag: String,
    /// JSON-encoded payload
    pub payload: Vec<u8>,
}

impl CacheEnvelope {
    /// Create a new envelope with current magic and version.
    pub fn new(type_tag: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            magic: CACHE_MAGIC,
            version: CURRENT_SCHEMA_VERSION,
            type_tag: type_tag.into(),
            payload,
        }
    }

    /// Encode the envelope frame.
    ///
    /// # Errors
    ///
    /// Returns `Error::SerializationError` if Postcard encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| {
            log::error!("Cache envelope serialization failed: {}", e);
            Error::SerializationError(e.to_string())
        })
    }

    /// Decode and validate an envelope frame.
    ///
    /// # Errors
    ///
    /// - `Error::DeserializationError`: frame is truncated or malformed
    /// - `Error::InvalidCacheEntry`: magic header mismatch
    /// - `Error::VersionMismatch`: schema version mismatch
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let envelope: CacheEnvelope = postcard::from_bytes(bytes).map_err(|e| {
            log::error!("Cache envelope deserialization failed: {}", e);
            Error::DeserializationError(e.to_string())
        })?;

        if envelope.magic != CACHE_MAGIC {
            log::warn!(
                "Invalid cache entry: expected magic {:?}, got {:?}",
                CACHE_MAGIC,
                envelope.magic
            );
            return Err(Error::InvalidCacheEntry(format!(
                "Invalid magic: expected {:?}, got {:?}",
                CACHE_MAGIC, envelope.magic
            )));
        }

        if envelope.version != CURRENT_SCHEMA_VERSION {
            log::warn!(
                "Cache version mismatch: expected {}, got {}",
                CURRENT_SCHEMA_VERSION,
                envelope.version
            );
            return Err(Error::VersionMismatch {
                expected: CURRENT_SCHEMA_VERSION,
                found: envelope.version,
            });
        }

        Ok(envelope)
    }

    /// Whether this envelope is the "no value" marker.
    pub fn is_null(&self) -> bool {
        self.type_tag == NULL_TYPE_TAG
    }
}

/// A value found in a cache tier.
#[derive(Debug, Clone, PartialEq)]
pub enum Cached<V> {
    /// A real value.
    Value(V),
    /// A cached "no value" marker (only written when null values are allowed).
    Null,
}

impl<V> Cached<V> {
    /// Collapse into an `Option`, mapping the null marker to `None`.
    pub fn into_option(self) -> Option<V> {
        match self {
            Cached::Value(v) => Some(v),
            Cached::Null => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cached::Null)
    }
}

impl<V> From<Option<V>> for Cached<V> {
    fn from(value: Option<V>) -> Self {
        match value {
            Some(v) => Cached::Value(v),
            None => Cached::Null,
        }
    }
}

/// A cached value read without a static type.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicValue {
    /// Type tag after alias resolution.
    pub type_tag: String,
    /// Whether the resolved tag belongs to a registered type.
    pub resolved: bool,
    /// Payload as a generic structural value.
    pub value: serde_json::Value,
}

/// Registry of known type tags and tag aliases.
///
/// Aliases map an old tag (for example the path of a type before it was moved
/// to another module) to its current tag, so entries written by older
/// deployments keep decoding.
#[derive(Default)]
pub struct TypeRegistry {
    aliases: RwLock<HashMap<String, String>>,
    known: RwLock<HashSet<String>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a Rust type so dynamic reads report its tag as resolved.
    pub fn register<V: ?Sized>(&self) {
        self.known.write().insert(type_tag::<V>().into_owned());
    }

    /// Map an old tag to a new one.
    pub fn alias(&self, old_tag: impl Into<String>, new_tag: impl Into<String>) {
        self.aliases.write().insert(old_tag.into(), new_tag.into());
    }

    /// Follow the alias chain of a tag.
    pub fn resolve(&self, tag: &str) -> String {
        let aliases = self.aliases.read();
        let mut current = tag;
        for _ in 0..MAX_ALIAS_HOPS {
            match aliases.get(current) {
                Some(next) if next != current => current = next,
                _ => break,
            }
        }
        current.to_string()
    }

    /// Whether a (resolved) tag belongs to a registered type.
    pub fn is_known(&self, tag: &str) -> bool {
        self.known.read().contains(tag)
    }
}

/// Encodes and decodes cached values through [`CacheEnvelope`].
#[derive(Clone, Default)]
pub struct ValueCodec {
    registry: Arc<TypeRegistry>,
}

impl ValueCodec {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        ValueCodec { registry }
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Encode a value, `None` producing the null marker.
    ///
    /// # Errors
    ///
    /// Returns `Error::SerializationError` if the value cannot be encoded.
    pub fn encode<V: Serialize + ?Sized>(&self, value: Option<&V>) -> Result<Vec<u8>> {
        let envelope = match value {
            Some(v) => {
                let payload = serde_json::to_vec(v).map_err(|e| {
                    log::error!("Cache serialization failed: {}", e);
                    Error::SerializationError(e.to_string())
                })?;
                CacheEnvelope::new(type_tag::<V>(), payload)
            }
            None => CacheEnvelope::new(NULL_TYPE_TAG, b"null".to_vec()),
        };
        envelope.to_bytes()
    }

    /// Decode a value of type `V`.
    ///
    /// # Errors
    ///
    /// - `Error::TypeMismatch`: stored tag does not resolve to `V`
    /// - `Error::DeserializationError` / `InvalidCacheEntry` / `VersionMismatch`:
    ///   the stored bytes are unusable
    pub fn decode<V: DeserializeOwned>(&self, bytes: &[u8]) -> Result<Cached<V>> {
        let envelope = CacheEnvelope::from_bytes(bytes)?;
        if envelope.is_null() {
            return Ok(Cached::Null);
        }

        let expected = type_tag::<V>();
        if envelope.type_tag != expected {
            let resolved = self.registry.resolve(&envelope.type_tag);
            if resolved != expected {
                log::error!(
                    "Cached type mismatch: expected {}, found {}",
                    expected,
                    resolved
                );
                return Err(Error::TypeMismatch {
                    expected: expected.to_string(),
                    found: resolved,
                });
            }
        }

        serde_json::from_slice(&envelope.payload)
            .map(Cached::Value)
            .map_err(|e| {
                log::error!("Cache payload deserialization failed: {}", e);
                Error::DeserializationError(e.to_string())
            })
    }

    /// Decode without a static type.
    ///
    /// Unresolvable tags are not an error: the payload is returned as a
    /// generic structural value with `resolved == false`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the envelope itself is unusable.
    pub fn decode_dynamic(&self, bytes: &[u8]) -> Result<DynamicValue> {
        let envelope = CacheEnvelope::from_bytes(bytes)?;
        let type_tag = self.registry.resolve(&envelope.type_tag);
        let resolved = envelope.is_null() || self.registry.is_known(&type_tag);
        let value = serde_json::from_slice(&envelope.payload).map_err(|e| {
            log::error!("Cache payload deserialization failed: {}", e);
            Error::DeserializationError(e.to_string())
        })?;

        Ok(DynamicValue {
            type_tag,
            resolved,
            value,
        })
    }
}
