// In-memory notification registries shared by the wait manager, the
// exchange manager, and the cache manager (§2 components 4 and 5).
//
// Both directories are plain `DashMap`s guarding broadcast-style wakeups;
// neither owns any cross-process state, so there is nothing here to
// persist or replicate.

use crate::common::{Key, SessionId};
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::Notify;

/// Multi-consumer release notifications indexed by `(key, session)`.
///
/// A waiter calls [`read_notify`]/[`write_notify`] to obtain the
/// [`Notify`] for the pair it cares about *before* re-checking the
/// predicate, then awaits `.notified()` inside a `select!` alongside a
/// termination future and a backoff timer (§4.4). Notifications are
/// fire-and-forget: if nobody is waiting when one arrives, it is simply
/// lost — callers are expected to re-read from storage on every wakeup
/// path (timer included), so a dropped notification only costs one extra
/// backoff round, never correctness.
#[derive(Default)]
pub struct LockWaitDirectory {
    read_waiters: DashMap<(Key, SessionId), Arc<Notify>>,
    write_waiters: DashMap<(Key, SessionId), Arc<Notify>>,
}

impl LockWaitDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_notify(&self, key: &Key, session: &SessionId) -> Arc<Notify> {
        self.read_waiters
            .entry((key.clone(), session.clone()))
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    pub fn write_notify(&self, key: &Key, session: &SessionId) -> Arc<Notify> {
        self.write_waiters
            .entry((key.clone(), session.clone()))
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Dispatch target for an inbound `ReleasedReadLock` message.
    pub fn notify_read(&self, key: &Key, session: &SessionId) {
        if let Some(notify) = self.read_waiters.get(&(key.clone(), session.clone())) {
            notify.notify_waiters();
        }
    }

    /// Dispatch target for an inbound `ReleasedWriteLock` message.
    pub fn notify_write(&self, key: &Key, session: &SessionId) {
        if let Some(notify) = self.write_waiters.get(&(key.clone(), session.clone())) {
            notify.notify_waiters();
        }
    }

    /// Memory reclamation: drop entries nobody else references. Safe to
    /// call opportunistically; a concurrent subscriber simply recreates
    /// the entry.
    pub fn sweep(&self) {
        self.read_waiters.retain(|_, v| Arc::strong_count(v) > 1);
        self.write_waiters.retain(|_, v| Arc::strong_count(v) > 1);
    }
}

/// An async invalidation callback, keyed per-key (§4.6 invalidation).
pub type InvalidationCallback = Arc<dyn Fn(Key) -> BoxFuture<'static, ()> + Send + Sync>;

/// `key -> set of invalidation callbacks`, invoked when the local session
/// receives an `InvalidateCacheEntry` addressed to it (§4.5 inbound
/// dispatch). The [`crate::cache::CacheManager`] registers one callback
/// per key it caches and deregisters it on invalidation or eviction.
#[derive(Default)]
pub struct InvalidationCallbackDirectory {
    callbacks: DashMap<Key, Vec<InvalidationCallback>>,
}

impl InvalidationCallbackDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: Key, callback: InvalidationCallback) {
        self.callbacks.entry(key).or_default().push(callback);
    }

    pub fn clear(&self, key: &Key) {
        self.callbacks.remove(key);
    }

    pub async fn invoke(&self, key: &Key) {
        let callbacks = self.callbacks.get(key).map(|v| v.clone());
        if let Some(callbacks) = callbacks {
            for callback in callbacks {
                callback(key.clone()).await;
            }
        }
    }
}
