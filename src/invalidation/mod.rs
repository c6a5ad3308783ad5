//! Cross-node L1 coherence over publish/subscribe.
//!
//! The outbound side publishes an [`InvalidationMessage`] whenever a node
//! evicts a key or clears a cache; publishing runs on a background task and
//! its failures are only logged. The inbound side is a single listener task
//! per bus that evicts the addressed key (or clears the whole cache) from the
//! node's own L1. The remote tier is never touched by inbound messages.
//!
//! Delivery is best-effort. The cache manager closes the gap with a delayed
//! re-check after each eviction.

pub mod transport;

pub use transport::{InvalidationTransport, LocalBroadcastTransport, Subscription};

use crate::error::{Error, Result};
use crate::local::LocalCacheRegistry;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Key carried by clear messages.
pub const CLEAR_ALL_KEY: &str = "*";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationKind {
    /// Drop one key from L1.
    Evict,
    /// Drop every key of the cache from L1.
    Clear,
}

/// Message exchanged between nodes on the invalidation channel.
///
/// Encoded as JSON so nodes of different builds can read each other.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct InvalidationMessage {
    pub cache_name: String,
    pub key: String,
    pub kind: InvalidationKind,
    /// Node that published the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl InvalidationMessage {
    pub fn evict(cache_name: impl Into<String>, key: impl Into<String>) -> Self {
        InvalidationMessage {
            cache_name: cache_name.into(),
            key: key.into(),
            kind: InvalidationKind::Evict,
            origin: None,
        }
    }

    pub fn clear(cache_name: impl Into<String>) -> Self {
        InvalidationMessage {
            cache_name: cache_name.into(),
            key: CLEAR_ALL_KEY.to_string(),
            kind: InvalidationKind::Clear,
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Both cache name and key must be non-blank.
    pub fn is_valid(&self) -> bool {
        !self.cache_name.trim().is_empty() && !self.key.trim().is_empty()
    }

    /// # Errors
    /// Returns `Error::SerializationError` if encoding fails
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::SerializationError(e.to_string()))
    }

    /// # Errors
    /// Returns `Error::DeserializationError` for malformed payloads
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::DeserializationError(e.to_string()))
    }
}

/// Counters of the inbound side.
#[derive(Debug, Default)]
struct Counters {
    applied: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InvalidationStats {
    /// Messages that evicted or cleared a local cache.
    pub applied: u64,
    /// Malformed, invalid or self-originated messages.
    pub dropped: u64,
}

/// Publish/subscribe bus keeping every node's L1 coherent.
pub struct InvalidationBus<P: InvalidationTransport> {
    transport: P,
    channel: String,
    node_id: String,
    registry: LocalCacheRegistry,
    listener: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl<P: InvalidationTransport> InvalidationBus<P> {
    pub fn new(
        transport: P,
        channel: impl Into<String>,
        node_id: impl Into<String>,
        registry: LocalCacheRegistry,
    ) -> Self {
        InvalidationBus {
            transport,
            channel: channel.into(),
            node_id: node_id.into(),
            registry,
            listener: Mutex::new(None),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn stats(&self) -> InvalidationStats {
        InvalidationStats {
            applied: self.counters.applied.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Publish on a background task. Never fails the caller.
    pub fn publish(&self, message: InvalidationMessage) -> JoinHandle<()> {
        let transport = self.transport.clone();
        let channel = self.channel.clone();
        let message = message.with_origin(self.node_id.clone());

        tokio::spawn(async move {
            if let Err(e) = send(&transport, &channel, &message).await {
                warn!(
                    "⚠ Invalidation publish for {}:{} failed: {}",
                    message.cache_name, message.key, e
                );
            }
        })
    }

    /// Publish and wait for the transport to accept the message.
    ///
    /// # Errors
    /// Returns `Err` if encoding or the transport fails
    pub async fn publish_now(&self, message: InvalidationMessage) -> Result<()> {
        let message = message.with_origin(self.node_id.clone());
        send(&self.transport, &self.channel, &message).await
    }

    /// Start the inbound listener.
    ///
    /// # Errors
    /// - `Error::IllegalState` if a listener is already running
    /// - `Err` from the transport if the subscription fails
    pub async fn subscribe(&self) -> Result<()> {
        let mut listener = self.listener.lock().await;
        if listener.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(Error::IllegalState(format!(
                "Invalidation bus already subscribed to {}",
                self.channel
            )));
        }

        let mut subscription = self.transport.subscribe(&self.channel).await?;
        let registry = self.registry.clone();
        let node_id = self.node_id.clone();
        let counters = Arc::clone(&self.counters);
        let channel = self.channel.clone();

        *listener = Some(tokio::spawn(async move {
            while let Some(payload) = subscription.recv().await {
                let applied = match InvalidationMessage::from_bytes(&payload) {
                    Ok(message) => apply(&registry, &node_id, &message),
                    Err(e) => {
                        warn!("Dropping malformed invalidation message: {}", e);
                        false
                    }
                };
                let counter = if applied {
                    &counters.applied
                } else {
                    &counters.dropped
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
            debug!("Invalidation listener on {} ended", channel);
        }));

        info!("✓ Invalidation bus subscribed to {}", self.channel);
        Ok(())
    }

    /// Stop the inbound listener. No-op when not subscribed.
    pub async fn unsubscribe(&self) {
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
            info!("✓ Invalidation bus unsubscribed from {}", self.channel);
        }
    }

    pub async fn is_subscribed(&self) -> bool {
        self.listener
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Apply a message to this node's L1 as if it had been received.
    ///
    /// Returns whether a local cache was touched.
    pub fn apply(&self, message: &InvalidationMessage) -> bool {
        apply(&self.registry, &self.node_id, message)
    }
}

impl<P: InvalidationTransport> Drop for InvalidationBus<P> {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.get_mut().take() {
            handle.abort();
        }
    }
}

async fn send<P: InvalidationTransport>(
    transport: &P,
    channel: &str,
    message: &InvalidationMessage,
) -> Result<()> {
    let payload = message.to_bytes()?;
    transport.publish(channel, payload).await?;
    debug!(
        "✓ Invalidation published {:?} {}:{}",
        message.kind, message.cache_name, message.key
    );
    Ok(())
}

fn apply(registry: &LocalCacheRegistry, node_id: &str, message: &InvalidationMessage) -> bool {
    if !message.is_valid() {
        warn!(
            "Dropping invalid invalidation message (cache '{}', key '{}')",
            message.cache_name, message.key
        );
        return false;
    }
    if message.origin.as_deref() == Some(node_id) {
        return false;
    }

    let cache = match registry.get(&message.cache_name) {
        Some(cache) => cache,
        None => {
            debug!("No local cache {} for invalidation", message.cache_name);
            return false;
        }
    };

    match message.kind {
        InvalidationKind::Evict => {
            cache.evict(&message.key);
        }
        InvalidationKind::Clear => {
            cache.clear();
            debug!("✓ Local CLEAR {} from invalidation", message.cache_name);
        }
    }
    true
}
