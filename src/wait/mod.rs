// Lock-wait coordination: exponential backoff over the three-way race
// between a session-termination signal, a gossip-driven wakeup, and a
// timer (§2 component 7, §4.4).
//
// `WaitManager` never touches `StoredEntry` invariants directly — it
// only re-reads images from storage and asks a predicate closure
// whether the wait is over. `LockManager` owns the predicates.

use crate::common::{CancellationToken, Key, SessionId};
use crate::directory::LockWaitDirectory;
use crate::error::{CoordinationError, Result};
use crate::exchange::ExchangeManager;
use crate::session::SessionManager;
use crate::storage::{CoordinationStorage, StoredEntry};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WaitKind {
    Read,
    Write,
}

/// Blocks callers on lock release, retrying with exponential backoff and
/// cleaning up after sessions that die mid-wait.
pub struct WaitManager {
    local_session: SessionId,
    storage: Arc<dyn CoordinationStorage>,
    session_manager: Arc<dyn SessionManager>,
    wait_directory: Arc<LockWaitDirectory>,
    exchange: Arc<ExchangeManager>,
    min_backoff: Duration,
    max_backoff: Duration,
}

impl WaitManager {
    pub fn new(
        local_session: SessionId,
        storage: Arc<dyn CoordinationStorage>,
        session_manager: Arc<dyn SessionManager>,
        wait_directory: Arc<LockWaitDirectory>,
        exchange: Arc<ExchangeManager>,
        min_backoff: Duration,
        max_backoff: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_session,
            storage,
            session_manager,
            wait_directory,
            exchange,
            min_backoff,
            max_backoff,
        })
    }

    /// Block until `entry`'s write-lock is free, or — if `allow_own_lock`
    /// is set — held by the local session. Returns the first image that
    /// satisfies that, or `None` if the entry disappears. Callers decide
    /// what a deleted or tombstoned image means; this method only
    /// resolves the lock race.
    pub async fn wait_for_write_lock_release(
        &self,
        entry: Option<StoredEntry>,
        allow_own_lock: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<StoredEntry>> {
        let mut current = entry;
        loop {
            let Some(image) = current else {
                return Ok(None);
            };
            match &image.write_lock {
                None => return Ok(Some(image)),
                Some(holder) if allow_own_lock && *holder == self.local_session => {
                    return Ok(Some(image))
                }
                Some(holder) => {
                    let holder = holder.clone();
                    let key = image.key.clone();
                    if !self.session_manager.is_alive(&holder) {
                        current = self.cleanup_terminated(&key, &holder).await?;
                        continue;
                    }
                    let local = self.local_session.clone();
                    current = self
                        .wait_for_lock_release_core(
                            &key,
                            &holder,
                            WaitKind::Write,
                            false,
                            cancel,
                            move |next: &Option<StoredEntry>| {
                                Ok(match next {
                                    None => true,
                                    Some(e) => {
                                        e.write_lock.is_none()
                                            || (allow_own_lock
                                                && e.write_lock.as_ref() == Some(&local))
                                    }
                                })
                            },
                        )
                        .await?;
                }
            }
        }
    }

    /// Block until every *foreign* read-lock on `entry` has drained.
    /// Requires `entry.write_lock == Some(local_session)` — the caller
    /// must already hold the write-lock before calling this, matching
    /// the acquire sequence in §4.3. Fails with `SessionTerminated` if
    /// the local session's own write-lock is lost while waiting (e.g.
    /// pruned by another session as dead).
    pub async fn wait_for_read_locks_release(
        &self,
        entry: StoredEntry,
        cancel: &CancellationToken,
    ) -> Result<Option<StoredEntry>> {
        if entry.write_lock.as_ref() != Some(&self.local_session) {
            return Err(CoordinationError::InvalidState(
                "wait_for_read_locks_release: local session does not hold the write_lock".into(),
            ));
        }
        let key = entry.key.clone();
        let foreign: Vec<SessionId> = entry
            .read_locks
            .iter()
            .filter(|s| **s != self.local_session)
            .cloned()
            .collect();

        for holder in foreign {
            self.drain_foreign_read_lock(&key, holder, cancel).await?;
        }

        self.storage.get_entry(&key).await
    }

    async fn drain_foreign_read_lock(
        &self,
        key: &Key,
        holder: SessionId,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !self.session_manager.is_alive(&holder) {
            self.cleanup_terminated(key, &holder).await?;
            return Ok(());
        }
        let local = self.local_session.clone();
        self.wait_for_lock_release_core(
            key,
            &holder,
            WaitKind::Read,
            true,
            cancel,
            move |next: &Option<StoredEntry>| match next {
                None => Err(CoordinationError::SessionTerminated),
                Some(e) => {
                    if e.write_lock.as_ref() != Some(&local) {
                        return Err(CoordinationError::SessionTerminated);
                    }
                    Ok(!e.read_locks.iter().any(|s| *s == holder))
                }
            },
        )
        .await?;
        Ok(())
    }

    /// One backoff loop: fire an optional nudge to `holder` (cache
    /// invalidation, only meaningful for a read-lock drain), then race a
    /// termination signal, a directory wakeup, a timer, and cancellation.
    /// Every wakeup path except termination re-reads storage and asks
    /// `predicate`; the loop only returns once the predicate says yes, the
    /// holder dies, or the caller cancels.
    async fn wait_for_lock_release_core(
        &self,
        key: &Key,
        holder: &SessionId,
        kind: WaitKind,
        invalidate: bool,
        cancel: &CancellationToken,
        mut predicate: impl FnMut(&Option<StoredEntry>) -> Result<bool>,
    ) -> Result<Option<StoredEntry>> {
        let mut backoff = self.min_backoff;
        loop {
            if invalidate {
                if let Err(e) = self.exchange.invalidate_cache_entry(key, holder).await {
                    debug!(%key, %holder, error = %e, "invalidation nudge failed, backoff continues");
                }
            }

            let termination = self.session_manager.wait_for_termination(holder);
            let notify = match kind {
                WaitKind::Read => self.wait_directory.read_notify(key, holder),
                WaitKind::Write => self.wait_directory.write_notify(key, holder),
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(CoordinationError::Cancelled);
                }
                _ = termination => {
                    return self.cleanup_terminated(key, holder).await;
                }
                _ = notify.notified() => {
                    let current = self.storage.get_entry(key).await?;
                    if predicate(&current)? {
                        return Ok(current);
                    }
                }
                _ = tokio::time::sleep(backoff) => {
                    let current = self.storage.get_entry(key).await?;
                    if predicate(&current)? {
                        return Ok(current);
                    }
                }
            }

            backoff = (backoff * 2).min(self.max_backoff);
        }
    }

    /// Drop every lock `holder` held on `key`, retrying the CAS against
    /// concurrent updates (§4.4 termination cleanup). A lock owned by the
    /// local session implies the local session itself was pruned as dead
    /// — surfaced as `SessionTerminated` rather than silently cleaned up.
    async fn cleanup_terminated(
        &self,
        key: &Key,
        holder: &SessionId,
    ) -> Result<Option<StoredEntry>> {
        if *holder == self.local_session {
            return Err(CoordinationError::SessionTerminated);
        }
        loop {
            let Some(image) = self.storage.get_entry(key).await? else {
                return Ok(None);
            };
            let holds_write = image.write_lock.as_ref() == Some(holder);
            let holds_read = image.read_locks.iter().any(|s| s == holder);
            if !holds_write && !holds_read {
                return Ok(Some(image));
            }

            let mut builder = image.builder();
            if holds_write {
                builder = builder.release_write_lock(holder)?;
            }
            builder = builder.release_read_lock(holder);
            let desired = builder.to_immutable(false);

            let prior = self
                .storage
                .update_entry(Some(desired.clone()), Some(image.clone()))
                .await?;
            if prior == Some(image) {
                if holds_write {
                    self.exchange.notify_write_lock_released(key).await;
                }
                if holds_read {
                    self.exchange.notify_read_lock_released(key).await;
                }
                return Ok(Some(desired));
            }
            // Lost the CAS race; loop re-reads the fresh image above.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InvalidationCallbackDirectory;
    use crate::exchange::{Message, PhysicalEndpoint};
    use crate::session::LocalSessionManager;
    use crate::storage::InMemoryStorage;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    fn sid(tag: &str) -> SessionId {
        SessionId::new(b"127.0.0.1:1".to_vec(), tag.as_bytes().to_vec())
    }

    #[derive(Default)]
    struct NullEndpoint {
        sent: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl PhysicalEndpoint for NullEndpoint {
        async fn send_to(&self, _target: &SessionId, _bytes: Vec<u8>) -> Result<()> {
            Ok(())
        }
        async fn recv(&self) -> Result<Vec<u8>> {
            std::future::pending().await
        }
    }

    struct Harness {
        local: SessionId,
        storage: Arc<InMemoryStorage>,
        sessions: Arc<LocalSessionManager>,
        wait_dir: Arc<LockWaitDirectory>,
        wait: Arc<WaitManager>,
    }

    fn harness() -> Harness {
        let local = sid("local");
        let storage = Arc::new(InMemoryStorage::new());
        let sessions = LocalSessionManager::new(local.clone(), Duration::from_secs(30));
        let wait_dir = Arc::new(LockWaitDirectory::new());
        let inval_dir = Arc::new(InvalidationCallbackDirectory::new());
        let endpoint = Arc::new(NullEndpoint::default());
        let exchange = ExchangeManager::new(
            sessions.clone(),
            wait_dir.clone(),
            inval_dir,
            endpoint,
        );
        let wait = WaitManager::new(
            local.clone(),
            storage.clone(),
            sessions.clone(),
            wait_dir.clone(),
            exchange,
            Duration::from_millis(5),
            Duration::from_millis(40),
        );
        Harness {
            local,
            storage,
            sessions,
            wait_dir,
            wait,
        }
    }

    #[tokio::test]
    async fn write_lock_already_free_returns_immediately() {
        let h = harness();
        let entry = StoredEntry::fresh("/x".to_string())
            .create(&h.local, vec![1])
            .unwrap()
            .to_immutable(true)
            .builder()
            .release_write_lock(&h.local)
            .unwrap()
            .to_immutable(false);

        let cancel = CancellationToken::new();
        let result = h
            .wait
            .wait_for_write_lock_release(Some(entry.clone()), false, &cancel)
            .await
            .unwrap();
        assert_eq!(result, Some(entry));
    }

    #[tokio::test]
    async fn write_lock_wait_wakes_on_gossip_release() {
        let h = harness();
        let peer = sid("peer");
        h.sessions.renew(&peer);
        let entry = StoredEntry::fresh("/x".to_string())
            .create(&peer, vec![1])
            .unwrap()
            .to_immutable(true);
        h.storage
            .update_entry(Some(entry.clone()), None)
            .await
            .unwrap();

        let wait = h.wait.clone();
        let key = entry.key.clone();
        let cancel = CancellationToken::new();
        let waiter = tokio::spawn(async move {
            wait.wait_for_write_lock_release(Some(entry), false, &cancel)
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let current = h.storage.get_entry(&key).await.unwrap().unwrap();
        let released = current
            .builder()
            .release_write_lock(&peer)
            .unwrap()
            .to_immutable(false);
        h.storage
            .update_entry(Some(released.clone()), Some(current))
            .await
            .unwrap();
        h.wait_dir.notify_write(&key, &peer);

        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap().write_lock, None);
    }

    #[tokio::test]
    async fn write_lock_wait_cleans_up_dead_holder() {
        let h = harness();
        let peer = sid("peer");
        h.sessions.renew(&peer);
        let entry = StoredEntry::fresh("/x".to_string())
            .create(&peer, vec![1])
            .unwrap()
            .to_immutable(true);
        h.storage
            .update_entry(Some(entry.clone()), None)
            .await
            .unwrap();

        h.sessions.terminate(&peer);
        let cancel = CancellationToken::new();
        let result = h
            .wait
            .wait_for_write_lock_release(Some(entry), false, &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.write_lock, None);
    }

    #[tokio::test]
    async fn cancellation_aborts_the_wait() {
        let h = harness();
        let peer = sid("peer");
        h.sessions.renew(&peer);
        let entry = StoredEntry::fresh("/x".to_string())
            .create(&peer, vec![1])
            .unwrap()
            .to_immutable(true);
        h.storage
            .update_entry(Some(entry.clone()), None)
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel2.cancel();
        });

        let result = h
            .wait
            .wait_for_write_lock_release(Some(entry), false, &cancel)
            .await;
        assert!(matches!(result, Err(CoordinationError::Cancelled)));
    }
}
