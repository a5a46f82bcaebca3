// Per-session cache with two-tier (local + global) locking (§2
// component 9, §4.6). Each cached key is backed by a pair of
// capacity-one semaphores that serialize this process's own
// transitions between "cache populated" and "cache empty" against the
// global lock state; the cache entries live in a map owned outright by
// `CacheManager` to avoid the cyclic entry/manager references the
// source exhibited (§9 design notes).

use crate::common::{CancellationToken, Key, SessionId};
use crate::error::{CoordinationError, Result};
use crate::directory::InvalidationCallbackDirectory;
use crate::lock::LockManager;
use crate::storage::{CoordinationStorage, StoredEntry, StoredEntryBuilder};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Semaphore;
use tracing::warn;

struct CacheEntry {
    key: Key,
    stored_entry: Mutex<Option<StoredEntry>>,
    local_read_lock: Semaphore,
    local_write_lock: Semaphore,
    invalidation_registered: AtomicBool,
}

impl CacheEntry {
    fn empty(key: Key) -> Self {
        Self {
            key,
            stored_entry: Mutex::new(None),
            local_read_lock: Semaphore::new(1),
            local_write_lock: Semaphore::new(1),
            invalidation_registered: AtomicBool::new(false),
        }
    }

    fn is_valid(&self) -> bool {
        self.stored_entry.lock().is_some()
    }
}

/// Mirrors coordinated entries locally, keeping the cached image
/// consistent with global lock ownership per the ordering protocol in
/// §4.6.
pub struct CacheManager {
    local_session: SessionId,
    entries: DashMap<Key, Arc<CacheEntry>>,
    storage: Arc<dyn CoordinationStorage>,
    lock_manager: Arc<LockManager>,
    invalidation_directory: Arc<InvalidationCallbackDirectory>,
}

impl CacheManager {
    pub fn new(
        local_session: SessionId,
        storage: Arc<dyn CoordinationStorage>,
        lock_manager: Arc<LockManager>,
        invalidation_directory: Arc<InvalidationCallbackDirectory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_session,
            entries: DashMap::new(),
            storage,
            lock_manager,
            invalidation_directory,
        })
    }

    fn entry_for(&self, key: &Key) -> Arc<CacheEntry> {
        self.entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(CacheEntry::empty(key.clone())))
            .clone()
    }

    /// Read path (§4.6 façade `get`): serve from cache if valid, else
    /// run the Update sequence (acquire local read-lock, acquire the
    /// global read-lock, populate, release local read-lock).
    pub async fn get(self: &Arc<Self>, key: &Key, cancel: &CancellationToken) -> Result<Option<Vec<u8>>> {
        let cache_entry = self.entry_for(key);
        let permit = cache_entry
            .local_read_lock
            .acquire()
            .await
            .expect("local_read_lock semaphore is never closed");

        if let Some(stored) = cache_entry.stored_entry.lock().clone() {
            return Ok(Some(stored.value));
        }

        let current = self.storage.get_entry(key).await?;
        let Some(image) = current else {
            return Ok(None);
        };
        let locked = self.lock_manager.acquire_read_lock(image, cancel).await?;
        let Some(locked) = locked else {
            return Ok(None);
        };

        let value = locked.value.clone();
        self.install(&cache_entry, locked);
        drop(permit);
        Ok(Some(value))
    }

    /// Invalidation sequence (§4.6): drop the cached image and release
    /// the global read-lock it was backing. Invoked either by an
    /// inbound `InvalidateCacheEntry` message or when this process
    /// itself needs to give up the read-lock (e.g. a failed mutation).
    pub async fn invalidate(&self, key: &Key) {
        let Some(cache_entry) = self.entries.get(key).map(|e| e.clone()) else {
            return;
        };
        let permit = cache_entry
            .local_read_lock
            .acquire()
            .await
            .expect("local_read_lock semaphore is never closed");

        let previous = cache_entry.stored_entry.lock().take();
        if let Some(stored) = previous {
            if let Err(e) = self.lock_manager.release_read_lock(stored).await {
                warn!(%key, error = %e, "failed to release read-lock while invalidating cache entry");
            }
        }
        drop(permit);
    }

    /// Mutation sequence (§4.6) against an entry that must already
    /// exist. `check` runs against the pre-acquire image — the last one
    /// a caller could plausibly have observed via `get` — before any
    /// lock is taken, so an optimistic-version check sees the version
    /// the caller actually expects rather than one already bumped by
    /// our own write-lock acquire. `build` then receives the
    /// write-locked image (foreign read-locks already drained) and
    /// returns the builder describing the desired change.
    pub async fn mutate(
        self: &Arc<Self>,
        key: &Key,
        cancel: &CancellationToken,
        check: impl FnOnce(&StoredEntry) -> Result<()>,
        build: impl FnOnce(StoredEntry) -> Result<StoredEntryBuilder>,
    ) -> Result<StoredEntry> {
        let cache_entry = self.entry_for(key);
        let (permit, authoritative) = match cache_entry.local_write_lock.try_acquire() {
            Ok(permit) => {
                let authoritative = cache_entry.stored_entry.lock().clone();
                (permit, authoritative)
            }
            Err(_) => {
                let permit = cache_entry
                    .local_write_lock
                    .acquire()
                    .await
                    .expect("local_write_lock semaphore is never closed");
                // Waited: the in-memory image may be stale, force a refetch.
                (permit, None)
            }
        };

        let seed = match authoritative {
            Some(stored) => Some(stored),
            None => self.storage.get_entry(key).await?,
        };
        let Some(seed) = seed else {
            drop(permit);
            return Err(CoordinationError::NotFound(key.clone()));
        };

        if let Err(e) = check(&seed) {
            drop(permit);
            return Err(e);
        }

        let result = self.mutate_locked(&cache_entry, seed, cancel, build).await;
        drop(permit);
        result
    }

    /// Creation path: acquires the write-lock for a key that may not
    /// exist yet, then installs `value` via its own CAS against
    /// whatever placeholder or pre-existing image the lock acquire
    /// produced.
    pub async fn create(
        self: &Arc<Self>,
        key: &Key,
        value: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<StoredEntry> {
        let cache_entry = self.entry_for(key);
        let permit = cache_entry
            .local_write_lock
            .acquire()
            .await
            .expect("local_write_lock semaphore is never closed");

        let locked = self
            .lock_manager
            .acquire_write_lock_for_key(key.clone(), cancel)
            .await?;
        let Some(locked) = locked else {
            drop(permit);
            return Err(CoordinationError::Fatal(
                "acquire_write_lock_for_key returned no image".into(),
            ));
        };

        if !locked.is_marked_as_deleted {
            let _ = self.lock_manager.release_write_lock(locked).await;
            drop(permit);
            return Err(CoordinationError::Exists(key.clone()));
        }

        // `locked` is already write-locked by the call above — unlike
        // `mutate`, there is no separate acquire step here, since a
        // placeholder for a brand-new key carries no foreign locks to
        // drain.
        let desired = match locked.builder().create(&self.local_session, value) {
            Ok(builder) => builder.to_immutable(false),
            Err(e) => {
                let _ = self.lock_manager.release_write_lock(locked).await;
                drop(permit);
                return Err(e);
            }
        };
        let result = self.finish_mutation(&cache_entry, locked, desired).await;
        drop(permit);
        result
    }

    async fn mutate_locked(
        self: &Arc<Self>,
        cache_entry: &Arc<CacheEntry>,
        seed: StoredEntry,
        cancel: &CancellationToken,
        build: impl FnOnce(StoredEntry) -> Result<StoredEntryBuilder>,
    ) -> Result<StoredEntry> {
        let key = seed.key.clone();
        let locked = self
            .lock_manager
            .acquire_write_lock_on_entry(seed, cancel)
            .await?;
        let Some(locked) = locked else {
            return Err(CoordinationError::NotFound(key));
        };

        let desired = match build(locked.clone()) {
            Ok(builder) => builder.to_immutable(false),
            Err(e) => {
                let _ = self.lock_manager.release_write_lock(locked).await;
                return Err(e);
            }
        };
        self.finish_mutation(cache_entry, locked, desired).await
    }

    /// Shared tail of every mutation: CAS the content change in using
    /// the already write-locked `locked` image as `expected`, then
    /// release the write-lock (downgrading per §3) and reconcile the
    /// cache with whatever image the release produced (§4.6 steps 3-5).
    async fn finish_mutation(
        self: &Arc<Self>,
        cache_entry: &Arc<CacheEntry>,
        locked: StoredEntry,
        desired: StoredEntry,
    ) -> Result<StoredEntry> {
        let prior = self
            .storage
            .update_entry(Some(desired.clone()), Some(locked.clone()))
            .await?;
        if prior != Some(locked.clone()) {
            // We were holding the write-lock with every foreign read-lock
            // already drained; the only way the image can have moved out
            // from under us is termination cleanup pruning our own lock,
            // which means our session is gone (§7, §8 S5).
            return Err(CoordinationError::SessionTerminated);
        }

        let released = self.lock_manager.release_write_lock(desired.clone()).await?;
        match &released {
            Some(image) if image.read_locks.contains(&self.local_session) => {
                self.install(cache_entry, image.clone());
            }
            _ => {
                *cache_entry.stored_entry.lock() = None;
            }
        }

        Ok(released.unwrap_or(desired))
    }

    fn install(self: &Arc<Self>, cache_entry: &Arc<CacheEntry>, stored: StoredEntry) {
        *cache_entry.stored_entry.lock() = Some(stored);
        if !cache_entry.invalidation_registered.swap(true, Ordering::SeqCst) {
            let weak: Weak<CacheManager> = Arc::downgrade(self);
            let key = cache_entry.key.clone();
            self.invalidation_directory.register(
                key,
                Arc::new(move |invalidated_key| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        if let Some(manager) = weak.upgrade() {
                            manager.invalidate(&invalidated_key).await;
                        }
                    })
                }),
            );
        }
    }

    /// Memory reclamation: drop cache entries that are empty and whose
    /// local locks are both free right now (§4.6 eviction). Pure
    /// housekeeping, no externally observable effect.
    pub fn evict_idle(&self) {
        self.entries.retain(|_, entry| {
            if entry.is_valid() {
                return true;
            }
            let Ok(read_permit) = entry.local_read_lock.try_acquire() else {
                return true;
            };
            let Ok(write_permit) = entry.local_write_lock.try_acquire() else {
                return true;
            };
            drop(read_permit);
            drop(write_permit);
            self.invalidation_directory.clear(&entry.key);
            false
        });
    }
}
