//! Single-flight protection for loads on a cache miss.
//!
//! Acquisition runs as a small state machine:
//!
//! ```text
//! disabled ───────────────────────────────────────────► Fallback(Disabled)
//! try_lock ──► acquired ──────────────────────────────► Acquired(Distributed)
//!    │  └──► held elsewhere, retry until lock_wait ───► Fallback(WaitExpired)
//!    └──► store error ──► local table, few retries ───► Acquired(Local)
//!                                   └────────────────► Fallback(LocalContended)
//! ```
//!
//! Every fallback leads to an unprotected load; a slow or broken lock never
//! blocks a caller for longer than `lock_wait`.

use crate::backend::RemoteStore;
use crate::config::StampedeConfig;
use crate::error::Error;
use lru::LruCache;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use uuid::Uuid;

type LockEntry = Arc<AsyncMutex<()>>;

/// Bounded table of per-key local mutexes.
///
/// Once the table grows past its capacity, least recently used entries that
/// nobody holds are dropped. Held entries are never dropped, so the table may
/// exceed its capacity while many keys are locked at once.
#[derive(Clone)]
pub struct LockTable {
    entries: Arc<Mutex<LruCache<String, LockEntry>>>,
    capacity: usize,
}

impl LockTable {
    pub fn new(capacity: usize) -> Self {
        LockTable {
            entries: Arc::new(Mutex::new(LruCache::unbounded())),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Try once to lock `key` without waiting.
    pub fn try_acquire(&self, key: &str) -> Option<LocalPermit> {
        let entry = self.entry(key);
        let guard = entry.try_lock_owned().ok()?;
        Some(LocalPermit {
            guard: Some(guard),
            key: key.to_string(),
            entries: Arc::clone(&self.entries),
        })
    }

    fn entry(&self, key: &str) -> LockEntry {
        let key = key.to_string();
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(&key) {
            return Arc::clone(entry);
        }

        let entry = Arc::new(AsyncMutex::new(()));
        entries.put(key, Arc::clone(&entry));
        if entries.len() > self.capacity {
            let excess = entries.len() - self.capacity;
            let idle: Vec<String> = entries
                .iter()
                .rev()
                .filter(|(_, lock)| Arc::strong_count(lock) == 1)
                .take(excess)
                .map(|(key, _)| key.clone())
                .collect();
            for key in idle {
                entries.pop(&key);
            }
        }
        entry
    }
}

/// Held local lock. Unlocks on drop and reclaims its table entry when idle.
pub struct LocalPermit {
    guard: Option<OwnedMutexGuard<()>>,
    key: String,
    entries: Arc<Mutex<LruCache<String, LockEntry>>>,
}

impl Drop for LocalPermit {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut entries = self.entries.lock();
        let idle = entries
            .peek(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            entries.pop(&self.key);
        }
    }
}

/// Why a load runs without single-flight protection.
#[derive(Debug)]
pub enum FallbackReason {
    /// Stampede protection is switched off.
    Disabled,
    /// Another holder kept the lock past `lock_wait`.
    WaitExpired,
    /// The lock store failed and no local fallback is configured.
    Unavailable(Error),
    /// The local fallback lock stayed contended through its retries.
    LocalContended,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::Disabled => write!(f, "disabled"),
            FallbackReason::WaitExpired => write!(f, "wait expired"),
            FallbackReason::Unavailable(e) => write!(f, "lock unavailable: {}", e),
            FallbackReason::LocalContended => write!(f, "local lock contended"),
        }
    }
}

enum HeldLock<S: RemoteStore> {
    Distributed { store: S, name: String, token: String },
    Local(LocalPermit),
}

/// Lock held for one load. Call [`LockGuard::release`] when done; a guard
/// dropped without release unlocks on a background task.
pub struct LockGuard<S: RemoteStore> {
    held: Option<HeldLock<S>>,
}

impl<S: RemoteStore> LockGuard<S> {
    pub fn is_distributed(&self) -> bool {
        matches!(self.held, Some(HeldLock::Distributed { .. }))
    }

    pub async fn release(mut self) {
        if let Some(held) = self.held.take() {
            release(held).await;
        }
    }
}

impl<S: RemoteStore> Drop for LockGuard<S> {
    fn drop(&mut self) {
        if let Some(held) = self.held.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(release(held));
                }
                Err(_) => warn!("⚠ Lock guard dropped outside a runtime, lease will expire"),
            }
        }
    }
}

async fn release<S: RemoteStore>(held: HeldLock<S>) {
    match held {
        HeldLock::Distributed { store, name, token } => match store.unlock(&name, &token).await {
            Ok(true) => debug!("✓ Lock released {}", name),
            Ok(false) => warn!("⚠ Lock {} expired before release", name),
            Err(e) => warn!("⚠ Lock {} release failed, lease will expire: {}", name, e),
        },
        HeldLock::Local(permit) => drop(permit),
    }
}

/// Outcome of [`StampedeGuard::acquire`].
pub enum Acquisition<S: RemoteStore> {
    Acquired(LockGuard<S>),
    Fallback(FallbackReason),
}

/// Named lock around loads, distributed through the remote store with a
/// local degradation path.
pub struct StampedeGuard<S: RemoteStore> {
    store: S,
    config: StampedeConfig,
    locks: LockTable,
}

impl<S: RemoteStore> StampedeGuard<S> {
    pub fn new(store: S, config: StampedeConfig) -> Self {
        let locks = LockTable::new(config.lock_table_capacity);
        StampedeGuard {
            store,
            config,
            locks,
        }
    }

    pub fn config(&self) -> &StampedeConfig {
        &self.config
    }

    pub fn lock_table(&self) -> &LockTable {
        &self.locks
    }

    /// Acquire the lock called `name`, waiting at most `lock_wait`.
    pub async fn acquire(&self, name: &str) -> Acquisition<S> {
        if !self.config.enabled {
            return Acquisition::Fallback(FallbackReason::Disabled);
        }

        match self.acquire_distributed(name).await {
            Ok(Some(guard)) => Acquisition::Acquired(guard),
            Ok(None) => {
                warn!(
                    "⚠ Lock {} not acquired within {:?}, loading unprotected",
                    name, self.config.lock_wait
                );
                Acquisition::Fallback(FallbackReason::WaitExpired)
            }
            Err(e) if self.config.local_fallback => {
                warn!("⚠ Distributed lock {} unavailable, using local lock: {}", name, e);
                self.acquire_local(name).await
            }
            Err(e) => {
                warn!("⚠ Distributed lock {} unavailable: {}", name, e);
                Acquisition::Fallback(FallbackReason::Unavailable(e))
            }
        }
    }

    async fn acquire_distributed(&self, name: &str) -> crate::Result<Option<LockGuard<S>>> {
        let token = Uuid::now_v7().to_string();
        // An unrepresentable wait has no deadline.
        let deadline = Instant::now().checked_add(self.config.lock_wait);

        loop {
            if self
                .store
                .try_lock(name, &token, self.config.lock_lease)
                .await?
            {
                debug!("✓ Lock acquired {}", name);
                return Ok(Some(LockGuard {
                    held: Some(HeldLock::Distributed {
                        store: self.store.clone(),
                        name: name.to_string(),
                        token,
                    }),
                }));
            }

            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    self.config.retry_interval.min(deadline - now)
                }
                None => self.config.retry_interval,
            };
            tokio::time::sleep(pause).await;
        }
    }

    async fn acquire_local(&self, name: &str) -> Acquisition<S> {
        for attempt in 0..=self.config.local_retries {
            if let Some(permit) = self.locks.try_acquire(name) {
                debug!("✓ Local lock acquired {}", name);
                return Acquisition::Acquired(LockGuard {
                    held: Some(HeldLock::Local(permit)),
                });
            }
            if attempt < self.config.local_retries {
                tokio::time::sleep(self.config.local_retry_interval).await;
            }
        }
        Acquisition::Fallback(FallbackReason::LocalContended)
    }
}
