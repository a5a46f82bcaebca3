// Public façade wiring every component into the five coordination
// operations a client actually calls (§2 component 10, §4.7).

use crate::cache::CacheManager;
use crate::common::{CancellationToken, Key, SessionId};
use crate::config::CoordinationConfig;
use crate::directory::{InvalidationCallbackDirectory, LockWaitDirectory};
use crate::error::{CoordinationError, Result};
use crate::exchange::{ExchangeManager, PhysicalEndpoint, UdpEndpoint};
use crate::lock::LockManager;
use crate::session::{LocalSessionManager, SessionManager};
use crate::storage::{CoordinationStorage, RetryingStorage, StoredEntry};
use crate::wait::WaitManager;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Entry point for the coordination engine. Wires storage, locking,
/// waiting, gossip, and caching together and exposes the public
/// operation set (§6 "Public API surface").
pub struct CoordinationManager {
    local_session: SessionId,
    storage: Arc<dyn CoordinationStorage>,
    session_manager: Arc<dyn SessionManager>,
    cache: Arc<CacheManager>,
    exchange: Arc<ExchangeManager>,
}

impl CoordinationManager {
    /// Assemble every layer from its collaborators. Does not spawn any
    /// background task — call [`Self::spawn_background_tasks`] once the
    /// returned manager is wrapped in the `Arc` the caller intends to
    /// share.
    pub fn new(
        local_session: SessionId,
        session_ttl: Duration,
        min_backoff: Duration,
        max_backoff: Duration,
        storage: Arc<dyn CoordinationStorage>,
        endpoint: Arc<dyn PhysicalEndpoint>,
    ) -> Arc<Self> {
        let session_manager = LocalSessionManager::new(local_session.clone(), session_ttl);
        let wait_directory = Arc::new(LockWaitDirectory::new());
        let invalidation_directory = Arc::new(InvalidationCallbackDirectory::new());

        let exchange = ExchangeManager::new(
            session_manager.clone(),
            wait_directory.clone(),
            invalidation_directory.clone(),
            endpoint,
        );

        let wait_manager = WaitManager::new(
            local_session.clone(),
            storage.clone(),
            session_manager.clone(),
            wait_directory,
            exchange.clone(),
            min_backoff,
            max_backoff,
        );

        let lock_manager = LockManager::new(
            local_session.clone(),
            storage.clone(),
            session_manager.clone(),
            wait_manager,
            exchange.clone(),
        );

        let cache = CacheManager::new(
            local_session.clone(),
            storage.clone(),
            lock_manager,
            invalidation_directory,
        );

        Arc::new(Self {
            local_session,
            storage,
            session_manager,
            cache,
            exchange,
        })
    }

    /// Build a manager bound to a UDP gossip endpoint and an
    /// in-process session registry, per [`CoordinationConfig`].
    pub async fn bind(
        config: &CoordinationConfig,
        storage: Arc<dyn CoordinationStorage>,
    ) -> Result<Arc<Self>> {
        let endpoint = UdpEndpoint::bind(config.bind_address).await?;
        let local_addr = endpoint.local_addr()?;
        let mut tag = config.multiplex_prefix.clone().into_bytes();
        tag.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
        let local_session = SessionId::from_socket_addr(local_addr, tag);
        info!(%local_session, bind = %local_addr, "coordination manager bound");

        let storage = RetryingStorage::new(storage, config.io_retry_budget);

        Ok(Self::new(
            local_session,
            config.session_ttl(),
            config.min_backoff(),
            config.max_backoff(),
            storage,
            Arc::new(endpoint),
        ))
    }

    /// Spawn the exchange receive loop. Intended to be called once,
    /// right after construction.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        let exchange = self.exchange.clone();
        tokio::spawn(async move {
            exchange.run_receive_loop().await;
        });
    }

    pub fn get_session(&self) -> SessionId {
        self.local_session.clone()
    }

    /// Returns the value at `key`, or `None` if it does not exist.
    pub async fn get(&self, key: &Key, cancel: &CancellationToken) -> Result<Option<Vec<u8>>> {
        self.cache.get(key, cancel).await
    }

    /// Creates a brand-new entry. Fails `Exists` if a live (non-deleted)
    /// image is already present.
    pub async fn create(
        &self,
        key: &Key,
        value: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<StoredEntry> {
        self.cache.create(key, value, cancel).await
    }

    /// `create`, falling back to the current value on `Exists`.
    pub async fn get_or_create(
        &self,
        key: &Key,
        value: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        match self.cache.create(key, value, cancel).await {
            Ok(entry) => Ok(entry.value),
            Err(CoordinationError::Exists(_)) => {
                self.get(key, cancel)
                    .await?
                    .ok_or_else(|| CoordinationError::NotFound(key.clone()))
            }
            Err(e) => Err(e),
        }
    }

    /// Replaces the value at `key`. `expected_version == 0` means "no
    /// optimistic check"; any other value must match the entry's
    /// current `storage_version` or the call fails `VersionConflict`.
    pub async fn set_value(
        &self,
        key: &Key,
        value: Vec<u8>,
        expected_version: u64,
        cancel: &CancellationToken,
    ) -> Result<StoredEntry> {
        let local = self.local_session.clone();
        self.cache
            .mutate(
                key,
                cancel,
                move |seed| check_version(seed, expected_version),
                move |image| image.builder().set_value(&local, value),
            )
            .await
    }

    /// Marks `key` deleted. Recursive child traversal is left to a
    /// higher layer that understands key hierarchy; this call only
    /// deletes the named entry itself.
    pub async fn delete(
        &self,
        key: &Key,
        expected_version: u64,
        recursive: bool,
        cancel: &CancellationToken,
    ) -> Result<StoredEntry> {
        if recursive {
            tracing::warn!(%key, "recursive delete requested; only the named key is deleted");
        }
        let local = self.local_session.clone();
        self.cache
            .mutate(
                key,
                cancel,
                move |seed| check_version(seed, expected_version),
                move |image| image.builder().mark_as_deleted(&local),
            )
            .await
    }

    pub fn session_manager(&self) -> Arc<dyn SessionManager> {
        self.session_manager.clone()
    }

    pub fn storage(&self) -> Arc<dyn CoordinationStorage> {
        self.storage.clone()
    }
}

fn check_version(image: &StoredEntry, expected_version: u64) -> Result<()> {
    if expected_version != 0 && image.storage_version != expected_version {
        return Err(CoordinationError::VersionConflict {
            expected: expected_version,
            found: image.storage_version,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Message;
    use crate::storage::InMemoryStorage;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

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

    fn manager() -> Arc<CoordinationManager> {
        let local = SessionId::new(b"127.0.0.1:1".to_vec(), b"t".to_vec());
        CoordinationManager::new(
            local,
            Duration::from_secs(30),
            Duration::from_millis(5),
            Duration::from_millis(40),
            Arc::new(InMemoryStorage::new()),
            Arc::new(NullEndpoint::default()),
        )
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let mgr = manager();
        let cancel = CancellationToken::new();
        let key = "/a".to_string();
        mgr.create(&key, vec![1, 2, 3], &cancel).await.unwrap();
        let value = mgr.get(&key, &cancel).await.unwrap();
        assert_eq!(value, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn get_or_create_returns_existing_value() {
        let mgr = manager();
        let cancel = CancellationToken::new();
        let key = "/a".to_string();
        mgr.create(&key, vec![1], &cancel).await.unwrap();
        let value = mgr.get_or_create(&key, vec![9, 9], &cancel).await.unwrap();
        assert_eq!(value, vec![1]);
    }

    #[tokio::test]
    async fn set_value_rejects_stale_version() {
        let mgr = manager();
        let cancel = CancellationToken::new();
        let key = "/a".to_string();
        mgr.create(&key, vec![1], &cancel).await.unwrap();

        let err = mgr.set_value(&key, vec![2], 999, &cancel).await;
        assert!(matches!(err, Err(CoordinationError::VersionConflict { .. })));
    }

    #[tokio::test]
    async fn delete_marks_entry_gone() {
        let mgr = manager();
        let cancel = CancellationToken::new();
        let key = "/a".to_string();
        mgr.create(&key, vec![1], &cancel).await.unwrap();
        mgr.delete(&key, 0, false, &cancel).await.unwrap();

        let value = mgr.get(&key, &cancel).await.unwrap();
        assert_eq!(value, None);
    }

    #[test]
    fn get_session_returns_local_identity() {
        let mgr = manager();
        assert_eq!(mgr.get_session().tag, b"t".to_vec());
    }
}
