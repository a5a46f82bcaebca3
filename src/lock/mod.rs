// Global (cluster-wide) lock acquire/release API: every transition is a
// CAS loop against `CoordinationStorage`, rejoined through
// `WaitManager` whenever a conflicting lock is in the way (§2 component
// 8, §4.3).

use crate::common::{CancellationToken, Key, SessionId};
use crate::error::{CoordinationError, Result};
use crate::exchange::ExchangeManager;
use crate::session::SessionManager;
use crate::storage::{CoordinationStorage, StoredEntry};
use crate::wait::WaitManager;
use std::sync::Arc;

pub struct LockManager {
    local_session: SessionId,
    storage: Arc<dyn CoordinationStorage>,
    session_manager: Arc<dyn SessionManager>,
    wait: Arc<WaitManager>,
    exchange: Arc<ExchangeManager>,
}

impl LockManager {
    pub fn new(
        local_session: SessionId,
        storage: Arc<dyn CoordinationStorage>,
        session_manager: Arc<dyn SessionManager>,
        wait: Arc<WaitManager>,
        exchange: Arc<ExchangeManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_session,
            storage,
            session_manager,
            wait,
            exchange,
        })
    }

    /// Acquire the write-lock for `key`, whether or not an entry exists
    /// yet. Against an absent key this installs a locked, still-deleted
    /// placeholder image (`storage_version = 1`) — it does not create
    /// content; callers that need a populated entry run their own CAS on
    /// top once they hold this lock (see
    /// [`crate::coordination::CoordinationManager::create`]).
    pub async fn acquire_write_lock_for_key(
        &self,
        key: Key,
        cancel: &CancellationToken,
    ) -> Result<Option<StoredEntry>> {
        loop {
            let desired = StoredEntry::fresh(key.clone())
                .acquire_write_lock(&self.local_session)?
                .to_immutable(true);
            let prior = self.storage.update_entry(Some(desired.clone()), None).await?;
            match prior {
                None => return Ok(Some(desired)),
                Some(existing) => {
                    match self.acquire_write_lock_on_entry(existing, cancel).await? {
                        Some(image) => return Ok(Some(image)),
                        None => continue,
                    }
                }
            }
        }
    }

    /// Acquire the write-lock starting from a known entry image (§4.3
    /// "acquire write-lock on an existing entry"). Drains any foreign
    /// write-lock via `WaitManager`, then drains foreign read-locks
    /// before returning.
    pub async fn acquire_write_lock_on_entry(
        &self,
        entry: StoredEntry,
        cancel: &CancellationToken,
    ) -> Result<Option<StoredEntry>> {
        if !self.session_manager.is_alive(&self.local_session) {
            return Err(CoordinationError::SessionTerminated);
        }

        let mut current = Some(entry);
        let acquired = loop {
            let released = self
                .wait
                .wait_for_write_lock_release(current.clone(), false, cancel)
                .await?;
            let Some(image) = released else {
                return Ok(None);
            };
            if image.is_marked_as_deleted {
                return Ok(None);
            }

            let desired = image
                .builder()
                .acquire_write_lock(&self.local_session)?
                .acquire_read_lock(&self.local_session)?
                .to_immutable(false);
            let prior = self
                .storage
                .update_entry(Some(desired.clone()), Some(image.clone()))
                .await?;
            if prior == Some(image) {
                break desired;
            }
            current = prior;
        };

        match self
            .wait
            .wait_for_read_locks_release(acquired.clone(), cancel)
            .await
        {
            Ok(final_image) => Ok(final_image),
            Err(e) => {
                let _ = self.release_write_lock(acquired).await;
                Err(e)
            }
        }
    }

    /// Release a write-lock held by the local session, downgrading to a
    /// read-lock unless the entry was marked deleted (§4.3, §3
    /// downgrade invariant). Idempotent: releasing a lock the local
    /// session no longer holds just returns the current image.
    pub async fn release_write_lock(&self, expected: StoredEntry) -> Result<Option<StoredEntry>> {
        let key = expected.key.clone();
        let mut current = Some(expected);
        loop {
            let Some(image) = current.clone() else {
                self.exchange.notify_write_lock_released(&key).await;
                return Ok(None);
            };
            if image.write_lock.as_ref() != Some(&self.local_session) {
                return Ok(Some(image));
            }

            let mut builder = image.builder().release_write_lock(&self.local_session)?;
            if !image.is_marked_as_deleted {
                builder = builder.acquire_read_lock(&self.local_session)?;
            }
            let desired = builder.to_immutable(false);

            let prior = self
                .storage
                .update_entry(Some(desired.clone()), Some(image.clone()))
                .await?;
            if prior == Some(image) {
                self.exchange.notify_write_lock_released(&key).await;
                return Ok(Some(desired));
            }
            current = prior;
        }
    }

    /// Acquire a read-lock, waiting out any foreign write-lock first. The
    /// local session is permitted to already hold the write-lock (§4.3
    /// acquire read-lock: `allow_write_lock = true`).
    pub async fn acquire_read_lock(
        &self,
        entry: StoredEntry,
        cancel: &CancellationToken,
    ) -> Result<Option<StoredEntry>> {
        let mut current = Some(entry);
        loop {
            let released = self
                .wait
                .wait_for_write_lock_release(current.clone(), true, cancel)
                .await?;
            let Some(image) = released else {
                return Ok(None);
            };
            if image.is_marked_as_deleted {
                return Ok(None);
            }

            let desired = image
                .builder()
                .acquire_read_lock(&self.local_session)?
                .to_immutable(false);
            let prior = self
                .storage
                .update_entry(Some(desired.clone()), Some(image.clone()))
                .await?;
            if prior == Some(image) {
                return Ok(Some(desired));
            }
            current = prior;
        }
    }

    /// Release a read-lock held by the local session. Per §4.3, a
    /// caller who does not currently hold the read-lock gets `None`
    /// back rather than the unchanged image.
    pub async fn release_read_lock(&self, expected: StoredEntry) -> Result<Option<StoredEntry>> {
        let key = expected.key.clone();
        let mut current = Some(expected);
        loop {
            let Some(image) = current.clone() else {
                return Ok(None);
            };
            if !image.read_locks.contains(&self.local_session) {
                return Ok(None);
            }

            let desired = image
                .builder()
                .release_read_lock(&self.local_session)
                .to_immutable(false);
            let prior = self
                .storage
                .update_entry(Some(desired.clone()), Some(image.clone()))
                .await?;
            if prior == Some(image) {
                self.exchange.notify_read_lock_released(&key).await;
                return Ok(Some(desired));
            }
            current = prior;
        }
    }
}
