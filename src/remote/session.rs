//! Pooled remote-shell sessions

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::pool::PoolShared;
use super::Transport;

/// One authenticated connection owned by a pool
pub struct Session {
    id: u64,
    transport: Box<dyn Transport>,
    created_at: Instant,
    last_used: Instant,
    last_validated: Instant,
    healthy: bool,
}

impl Session {
    pub(crate) fn new(id: u64, transport: Box<dyn Transport>) -> Self {
        let now = Instant::now();
        Self {
            id,
            transport,
            created_at: now,
            last_used: now,
            last_validated: now,
            healthy: true,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Record a successful round trip
    pub(crate) fn touch(&mut self) {
        let now = Instant::now();
        self.last_used = now;
        self.last_validated = now;
    }

    pub(crate) fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    /// Whether the session sat idle long enough to need a probe
    pub(crate) fn needs_validation(&self, threshold: Duration) -> bool {
        self.last_validated.elapsed() >= threshold
    }

    pub(crate) fn close(&self) {
        self.transport.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("healthy", &self.healthy)
            .field("age", &self.created_at.elapsed())
            .finish()
    }
}

/// A session lent out by the pool
///
/// Hand it back with [`SessionPool::release`](super::SessionPool::release) or
/// [`SessionPool::invalidate`](super::SessionPool::invalidate). Dropping it
/// without doing either (a cancelled caller, for instance) closes the
/// connection and frees its slot.
pub struct PooledSession {
    session: Option<Session>,
    pool: Arc<PoolShared>,
}

impl PooledSession {
    pub(crate) fn new(session: Session, pool: Arc<PoolShared>) -> Self {
        Self {
            session: Some(session),
            pool,
        }
    }

    fn inner(&self) -> &Session {
        self.session
            .as_ref()
            .expect("pooled session accessed after being returned")
    }

    fn inner_mut(&mut self) -> &mut Session {
        self.session
            .as_mut()
            .expect("pooled session accessed after being returned")
    }

    pub fn id(&self) -> u64 {
        self.inner().id()
    }

    pub fn host(&self) -> &str {
        self.pool.host()
    }

    pub fn is_healthy(&self) -> bool {
        self.inner().is_healthy()
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.inner().transport()
    }

    pub(crate) fn touch(&mut self) {
        self.inner_mut().touch();
    }

    pub(crate) fn mark_unhealthy(&mut self) {
        self.inner_mut().mark_unhealthy();
    }

    pub(crate) fn belongs_to(&self, pool: &Arc<PoolShared>) -> bool {
        Arc::ptr_eq(&self.pool, pool)
    }

    /// Give the session back; healthy sessions go back to the idle set
    pub(crate) fn finish(mut self, keep: bool) {
        if let Some(session) = self.session.take() {
            self.pool.return_session(session, keep);
        }
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.return_session(session, false);
        }
    }
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("host", &self.pool.host())
            .field("session", &self.session)
            .finish()
    }
}
