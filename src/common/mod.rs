// Shared identifiers used across the coordination engine.
//
// This module is the analogue of a database's type-alias module: small,
// widely imported, and otherwise uninteresting.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A coordinated key. The engine treats keys as opaque byte strings; this
/// alias exists so call sites read as intent rather than `String`.
pub type Key = String;

/// Opaque session identifier: `(physical_address_bytes, session_tag_bytes)`.
///
/// Ordering and hashing are defined by the byte-lexicographic pair, so
/// `SessionId` can be used directly as a map key or inside a `BTreeSet`
/// without a custom `Ord` impl beyond the derive below.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId {
    /// Address the `ExchangeManager` uses to reach this session.
    pub address: Vec<u8>,
    /// Disambiguates multiple sessions sharing one address (reconnects).
    pub tag: Vec<u8>,
}

impl SessionId {
    pub fn new(address: impl Into<Vec<u8>>, tag: impl Into<Vec<u8>>) -> Self {
        Self {
            address: address.into(),
            tag: tag.into(),
        }
    }

    /// Parse the address half back into a socket address, when the address
    /// bytes were produced from one (the common case for a UDP endpoint).
    pub fn socket_addr(&self) -> Option<std::net::SocketAddr> {
        std::str::from_utf8(&self.address)
            .ok()
            .and_then(|s| s.parse().ok())
    }

    pub fn from_socket_addr(addr: std::net::SocketAddr, tag: impl Into<Vec<u8>>) -> Self {
        Self::new(addr.to_string().into_bytes(), tag)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}",
            String::from_utf8_lossy(&self.address),
            String::from_utf8_lossy(&self.tag)
        )
    }
}

/// A cooperative cancellation signal, threaded through every blocking
/// wait so a caller (or a session's own shutdown path) can abort a
/// pending `acquire_*`/`wait_for_*` call instead of leaving it parked
/// until the next backoff tick.
///
/// Cloning shares the same underlying signal; cancelling any clone
/// cancels all of them. There is no "uncancel" — a token is single-use,
/// matching the lifetime of one logical operation.
#[derive(Clone, Default)]
pub struct CancellationToken {
    notify: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called. Resolves immediately if
    /// it already has been.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}
