// Datagram-based peer messenger: encodes/decodes the wire protocol and
// dispatches inbound messages into the wait/invalidation directories
// (§2 component 6, §4.5).

pub mod codec;

use crate::common::{Key, SessionId};
use crate::directory::{InvalidationCallbackDirectory, LockWaitDirectory};
use crate::error::Result;
use crate::session::SessionManager;
use async_trait::async_trait;
use codec::Message;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Best-effort datagram send/receive, addressed by [`SessionId`] (§6
/// physical endpoint interface). Out of spec detail; the reference `Udp`
/// implementation below exists so the crate runs standalone.
#[async_trait]
pub trait PhysicalEndpoint: Send + Sync {
    /// Send `bytes` to `target`. Transport-level failures (peer
    /// unreachable, socket error) are swallowed by the caller, not here —
    /// implementations should surface them so `ExchangeManager` can log
    /// and move on.
    async fn send_to(&self, target: &SessionId, bytes: Vec<u8>) -> Result<()>;

    /// Block until one datagram arrives, returning its raw payload.
    async fn recv(&self) -> Result<Vec<u8>>;
}

/// [`PhysicalEndpoint`] over a UDP socket, addressing peers by the
/// socket address embedded in their [`SessionId`].
pub struct UdpEndpoint {
    socket: UdpSocket,
}

impl UdpEndpoint {
    pub async fn bind(addr: std::net::SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl PhysicalEndpoint for UdpEndpoint {
    async fn send_to(&self, target: &SessionId, bytes: Vec<u8>) -> Result<()> {
        let addr = target.socket_addr().ok_or_else(|| {
            crate::error::CoordinationError::Network(format!(
                "session {target} carries no resolvable address"
            ))
        })?;
        self.socket.send_to(&bytes, addr).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; 64 * 1024];
        let (len, _from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(len);
        Ok(buf)
    }
}

/// Gossips lock-release and cache-invalidation messages between sessions.
pub struct ExchangeManager {
    session_manager: Arc<dyn SessionManager>,
    wait_directory: Arc<LockWaitDirectory>,
    invalidation_directory: Arc<InvalidationCallbackDirectory>,
    endpoint: Arc<dyn PhysicalEndpoint>,
}

impl ExchangeManager {
    pub fn new(
        session_manager: Arc<dyn SessionManager>,
        wait_directory: Arc<LockWaitDirectory>,
        invalidation_directory: Arc<InvalidationCallbackDirectory>,
        endpoint: Arc<dyn PhysicalEndpoint>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_manager,
            wait_directory,
            invalidation_directory,
            endpoint,
        })
    }

    /// Request that `target` drop its cache entry for `key`. Local
    /// delivery bypasses the network entirely. The embedded `session` is
    /// `target` itself, not the sender — `dispatch` uses it to confirm a
    /// received frame was actually addressed to this process rather than
    /// misrouted.
    pub async fn invalidate_cache_entry(&self, key: &Key, target: &SessionId) -> Result<()> {
        let local = self.session_manager.local_session();
        if *target == local {
            self.invalidation_directory.invoke(key).await;
            return Ok(());
        }
        self.send(
            target,
            Message::InvalidateCacheEntry {
                key: key.clone(),
                session: target.clone(),
            },
        )
        .await
    }

    /// Fan out a read-lock release to every live session (§4.5 outbound
    /// fan-out). Local delivery notifies the directory directly.
    pub async fn notify_read_lock_released(&self, key: &Key) {
        self.fan_out(key, Message::ReleasedReadLock {
            key: key.clone(),
            session: self.session_manager.local_session(),
        })
        .await;
    }

    /// Fan out a write-lock release to every live session.
    pub async fn notify_write_lock_released(&self, key: &Key) {
        self.fan_out(key, Message::ReleasedWriteLock {
            key: key.clone(),
            session: self.session_manager.local_session(),
        })
        .await;
    }

    async fn fan_out(&self, key: &Key, message: Message) {
        let local = self.session_manager.local_session();
        for session in self.session_manager.enumerate_sessions() {
            if session == local {
                self.dispatch(message.clone());
                continue;
            }
            if let Err(e) = self.send(&session, message.clone()).await {
                warn!(peer = %session, %key, error = %e, "best-effort notification send failed");
            }
        }
    }

    async fn send(&self, target: &SessionId, message: Message) -> Result<()> {
        let frame = message.encode();
        self.endpoint.send_to(target, frame.to_vec()).await
    }

    /// Decode and route one inbound message (§4.5 inbound dispatch).
    /// Malformed frames are logged and dropped, never panicked on.
    pub fn dispatch(&self, message: Message) {
        match message {
            Message::ReleasedReadLock { key, session } => {
                debug!(%key, %session, "read lock released");
                self.wait_directory.notify_read(&key, &session);
            }
            Message::ReleasedWriteLock { key, session } => {
                debug!(%key, %session, "write lock released");
                self.wait_directory.notify_write(&key, &session);
            }
            Message::InvalidateCacheEntry { key, session } => {
                let local = self.session_manager.local_session();
                if session == local {
                    let directory = self.invalidation_directory.clone();
                    tokio::spawn(async move { directory.invoke(&key).await });
                } else {
                    debug!(%key, %session, "ignoring invalidation addressed to a foreign session");
                }
            }
        }
    }

    /// Drive the receive loop for `self.endpoint` until it errors.
    /// Intended to be spawned once per process.
    pub async fn run_receive_loop(self: Arc<Self>) {
        loop {
            match self.endpoint.recv().await {
                Ok(bytes) => match Message::decode(&bytes) {
                    Ok(message) => self.dispatch(message),
                    Err(e) => warn!(error = %e, "dropping malformed exchange frame"),
                },
                Err(e) => {
                    warn!(error = %e, "exchange receive loop terminating");
                    return;
                }
            }
        }
    }
}
