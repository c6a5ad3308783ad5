//! Per-entry time-to-live.

use std::time::Duration;

/// Time-to-live requested for a single write.
///
/// | Variant | Effect |
/// |---------|--------|
/// | `Default` | Use the cache-level TTL from the cache's specification |
/// | `Never` | Entry never expires (size eviction still applies locally) |
/// | `After(d)` | Entry expires `d` after the write; `d == 0` evicts immediately |
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Ttl {
    #[default]
    Default,
    Never,
    After(Duration),
}

/// What a write should actually do once its TTL is resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expiry {
    /// Do not write; remove any existing entry instead.
    Evict,
    /// Write without expiration.
    Never,
    /// Write and expire after the duration.
    After(Duration),
}

impl Ttl {
    /// Convert a signed millisecond count: negative means no expiry, zero
    /// means evict immediately.
    pub fn from_millis(millis: i64) -> Self {
        if millis < 0 {
            Ttl::Never
        } else {
            Ttl::After(Duration::from_millis(millis as u64))
        }
    }

    /// Resolve against a cache-level default.
    ///
    /// A cache-level default of zero means "no expiry"; only an explicit
    /// per-entry zero evicts.
    pub fn resolve(self, default: Duration) -> Expiry {
        match self {
            Ttl::Default if default.is_zero() => Expiry::Never,
            Ttl::Default => Expiry::After(default),
            Ttl::Never => Expiry::Never,
            Ttl::After(d) if d.is_zero() => Expiry::Evict,
            Ttl::After(d) => Expiry::After(d),
        }
    }
}

impl From<Duration> for Ttl {
    fn from(d: Duration) -> Self {
        Ttl::After(d)
    }
}

impl Expiry {
    /// Duration to hand to a store, `None` meaning no expiration.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Expiry::After(d) => Some(*d),
            _ => None,
        }
    }
}
