//! Publish/subscribe transports for invalidation messages.

use crate::error::Result;
use std::future::Future;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Buffered messages per in-process subscriber before it starts lagging.
const LOCAL_CHANNEL_CAPACITY: usize = 1_024;

/// Trait for the pub/sub primitive the invalidation bus runs on.
///
/// Delivery is at-least-once at best and unordered; the bus never relies on
/// a message arriving.
pub trait InvalidationTransport: Send + Sync + Clone + 'static {
    /// Publish a payload to every subscriber of `channel`.
    ///
    /// # Errors
    /// Returns `Err` if the transport cannot accept the message
    fn publish(&self, channel: &str, payload: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    /// Start receiving payloads published to `channel`.
    ///
    /// # Errors
    /// Returns `Err` if the subscription cannot be established
    fn subscribe(&self, channel: &str) -> impl Future<Output = Result<Subscription>> + Send;
}

/// Stream of payloads from one channel.
///
/// Dropping the subscription stops the task feeding it.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    forwarder: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Wrap a receiver fed by `forwarder`.
    pub fn new(receiver: mpsc::UnboundedReceiver<Vec<u8>>, forwarder: JoinHandle<()>) -> Self {
        Subscription {
            receiver,
            forwarder: Some(forwarder),
        }
    }

    /// A subscription fed directly through the returned sender.
    pub fn channel() -> (mpsc::UnboundedSender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Subscription {
                receiver: rx,
                forwarder: None,
            },
        )
    }

    /// Next payload, or `None` once the transport side has gone away.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

/// In-process transport over a tokio broadcast channel.
///
/// Clones share the channel, so several cache managers built on clones of
/// one transport see each other's messages like nodes on one Redis.
#[derive(Clone)]
pub struct LocalBroadcastTransport {
    sender: broadcast::Sender<(String, Vec<u8>)>,
}

impl LocalBroadcastTransport {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(LOCAL_CHANNEL_CAPACITY);
        LocalBroadcastTransport { sender }
    }

    /// Number of live subscriptions across all channels.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LocalBroadcastTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InvalidationTransport for LocalBroadcastTransport {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        match self.sender.send((channel.to_string(), payload)) {
            Ok(receivers) => debug!("✓ Local PUBLISH {} -> {} receivers", channel, receivers),
            // No subscribers: nothing to deliver, same as a Redis PUBLISH returning 0.
            Err(_) => debug!("✓ Local PUBLISH {} -> no receivers", channel),
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut rx = self.sender.subscribe();
        let (tx, receiver) = mpsc::unbounded_channel();
        let wanted = channel.to_string();

        let forwarder = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok((channel, payload)) => {
                        if channel == wanted && tx.send(payload).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("⚠ Local subscriber on {} lagged, {} messages lost", wanted, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        debug!("✓ Local SUBSCRIBE {}", channel);
        Ok(Subscription::new(receiver, forwarder))
    }
}
