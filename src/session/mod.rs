// Session registry: identity of the local session plus liveness tracking
// of peers (§4.4 termination cleanup, §6 session manager interface).
//
// This is an "external collaborator" per the core spec — the coordination
// engine only ever calls `is_alive`/`wait_for_termination`/
// `enumerate_sessions` through the `SessionManager` trait below. The
// in-process implementation here exists so the crate is runnable and
// testable standalone; a cluster deployment is expected to plug in a
// registry backed by its own membership protocol.

use crate::common::SessionId;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Identity and liveness lookups for sessions participating in the
/// coordination service.
#[async_trait]
pub trait SessionManager: Send + Sync {
    /// The session this process is operating as.
    fn local_session(&self) -> SessionId;

    /// Best-effort liveness check. A `false` result triggers termination
    /// cleanup in [`crate::wait::WaitManager`]; it must eventually become
    /// stable (no flapping back to `true` for a session that already
    /// reported dead) or cleanup races will never converge.
    fn is_alive(&self, session: &SessionId) -> bool;

    /// Resolves once `session` is observed to no longer be alive.
    /// Resolves immediately if the session is already dead or unknown.
    async fn wait_for_termination(&self, session: &SessionId);

    /// Snapshot of currently-live sessions, used by
    /// [`crate::exchange::ExchangeManager`] to fan out release
    /// notifications.
    fn enumerate_sessions(&self) -> Vec<SessionId>;
}

struct SessionHandle {
    last_heartbeat: Mutex<Instant>,
    terminated: Notify,
}

/// In-process [`SessionManager`]: sessions self-renew with `renew`, and a
/// session is considered dead once `session_ttl` has elapsed since its
/// last renewal. Checks are lazy — `is_alive` evaluates the deadline on
/// read rather than running a background reaper, since the only consumer
/// of staleness (`WaitManager`) already polls on its own backoff schedule.
pub struct LocalSessionManager {
    local: SessionId,
    session_ttl: Duration,
    registry: DashMap<SessionId, Arc<SessionHandle>>,
}

impl LocalSessionManager {
    pub fn new(local: SessionId, session_ttl: Duration) -> Arc<Self> {
        let mgr = Arc::new(Self {
            local: local.clone(),
            session_ttl,
            registry: DashMap::new(),
        });
        mgr.renew(&local);
        mgr
    }

    /// Record (or create) a heartbeat for `session`.
    pub fn renew(&self, session: &SessionId) {
        match self.registry.get(session) {
            Some(handle) => {
                *handle.last_heartbeat.lock() = Instant::now();
            }
            None => {
                self.registry.insert(
                    session.clone(),
                    Arc::new(SessionHandle {
                        last_heartbeat: Mutex::new(Instant::now()),
                        terminated: Notify::new(),
                    }),
                );
            }
        }
    }

    /// Renew the local session's own heartbeat; callers run this on a
    /// timer to stay alive in peers' registries.
    pub fn renew_local(&self) {
        self.renew(&self.local);
    }

    /// Explicitly terminate a session (e.g. on clean disconnect) rather
    /// than waiting for its TTL to lapse.
    pub fn terminate(&self, session: &SessionId) {
        if let Some((_, handle)) = self.registry.remove(session) {
            handle.terminated.notify_waiters();
        }
    }

    fn expire_if_stale(&self, session: &SessionId) -> bool {
        let Some(handle) = self.registry.get(session).map(|h| h.clone()) else {
            return false;
        };
        let stale = handle.last_heartbeat.lock().elapsed() > self.session_ttl;
        if stale {
            drop(handle);
            self.terminate(session);
        }
        stale
    }
}

#[async_trait]
impl SessionManager for LocalSessionManager {
    fn local_session(&self) -> SessionId {
        self.local.clone()
    }

    fn is_alive(&self, session: &SessionId) -> bool {
        if self.expire_if_stale(session) {
            return false;
        }
        self.registry.contains_key(session)
    }

    async fn wait_for_termination(&self, session: &SessionId) {
        loop {
            let handle = match self.registry.get(session) {
                Some(h) => h.clone(),
                None => return,
            };
            let notified = handle.terminated.notified();
            if !self.is_alive(session) {
                return;
            }
            notified.await;
            if !self.is_alive(session) {
                return;
            }
        }
    }

    fn enumerate_sessions(&self) -> Vec<SessionId> {
        self.registry
            .iter()
            .map(|e| e.key().clone())
            .filter(|s| self.is_alive(s))
            .collect()
    }
}
