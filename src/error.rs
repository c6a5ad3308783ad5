//! Error types for the tiered cache.

use std::fmt;

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the tiered cache.
///
/// Variants fall into the classes the cache distinguishes at runtime:
/// codec failures (recovered by evicting the entry), type mismatches (always
/// surfaced), configuration mistakes (surfaced at wiring time) and
/// infrastructure failures (surfaced only by operations that need the remote
/// tier).
#[derive(Debug, Clone)]
pub enum Error {
    /// Serialization failed when converting a value or key to cache bytes.
    ///
    /// Common causes:
    /// - Value contains non-serializable types (e.g. maps with non-string keys)
    /// - Postcard codec error
    SerializationError(String),

    /// Deserialization failed when converting cache bytes to a value.
    ///
    /// **Recovery:** Cache entry is evicted and treated as a miss.
    DeserializationError(String),

    /// Invalid cache entry: corrupted envelope or bad magic.
    ///
    /// Returned when:
    /// - Magic header is not `b"TIER"`
    /// - Non tier-cache data sits under a tier-cache key
    ///
    /// **Recovery:** Cache entry is evicted and treated as a miss.
    InvalidCacheEntry(String),

    /// Envelope schema version differs from the compiled one.
    ///
    /// **Recovery:** Cache entry is evicted and recomputed on next access.
    VersionMismatch {
        /// Expected schema version (from compiled code)
        expected: u32,
        /// Found schema version (from cached entry)
        found: u32,
    },

    /// The stored value's type tag does not resolve to the requested type.
    ///
    /// Never recovered silently: returning a wrong-typed value is worse than
    /// failing loudly.
    TypeMismatch {
        /// Type tag of the requested Rust type
        expected: String,
        /// Type tag found in the stored envelope (after alias resolution)
        found: String,
    },

    /// Remote store or pub/sub transport error (Redis, etc).
    ///
    /// Common causes:
    /// - Connection lost
    /// - Network timeout
    /// - Backend protocol error
    BackendError(String),

    /// A caller-supplied loader failed to produce a value.
    LoaderError(String),

    /// Invalid configuration (illegal argument).
    ///
    /// Common causes:
    /// - `local_max_size` of zero
    /// - Bloom filter false positive rate outside `(0, 1)`
    /// - No specification resolvable for a cache name
    ///
    /// **Recovery:** Fix configuration and restart.
    ConfigError(String),

    /// Operation invoked in a state where it is a programming error.
    ///
    /// Raised when:
    /// - A bloom filter insert targets a cache whose filter is disabled
    /// - Key construction yields an empty key
    /// - The invalidation bus is subscribed twice
    IllegalState(String),

    /// Generic error with custom message.
    Other(String),
}

impl Error {
    /// Whether this error means the stored bytes are unusable and the entry
    /// should be dropped rather than surfaced.
    pub fn is_corrupt_entry(&self) -> bool {
        matches!(
            self,
            Error::DeserializationError(_)
                | Error::InvalidCacheEntry(_)
                | Error::VersionMismatch { .. }
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            Error::DeserializationError(msg) => write!(f, "Deserialization error: {}", msg),
            Error::InvalidCacheEntry(msg) => write!(f, "Invalid cache entry: {}", msg),
            Error::VersionMismatch { expected, found } => {
                write!(
                    f,
                    "Cache version mismatch: expected {}, found {}",
                    expected, found
                )
            }
            Error::TypeMismatch { expected, found } => {
                write!(
                    f,
                    "Cached type mismatch: expected {}, found {}",
                    expected, found
                )
            }
            Error::BackendError(msg) => write!(f, "Backend error: {}", msg),
            Error::LoaderError(msg) => write!(f, "Loader error: {}", msg),
            Error::ConfigError(msg) => write!(f, "Config error: {}", msg),
            Error::IllegalState(msg) => write!(f, "Illegal state: {}", msg),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            Error::BackendError(e.to_string())
        } else if e.is_syntax() || e.is_eof() {
            Error::DeserializationError(e.to_string())
        } else {
            Error::SerializationError(e.to_string())
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::BackendError(e.to_string())
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::BackendError(format!("Redis error: {}", e))
    }
}
