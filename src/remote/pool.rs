//! Bounded per-host session pool
//!
//! Accounting (idle set, borrowed count) lives behind one short mutex per
//! host. Opening, probing and closing connections always happens outside of
//! it. A slot is reserved before a connection is opened, so
//! `idle + borrowed <= max_pool_size` holds even while connects are in flight.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RemoteHostConfig;
use crate::error::RemoteError;
use crate::metrics;

use super::session::{PooledSession, Session};
use super::Connector;

/// Accounting snapshot for one host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub idle: usize,
    pub borrowed: usize,
    pub total_created: u64,
    pub max_size: usize,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Session>,
    /// Sessions lent out plus slots reserved for connects in progress
    borrowed: usize,
    total_created: u64,
    closed: bool,
}

pub(crate) struct PoolShared {
    config: Arc<RemoteHostConfig>,
    state: Mutex<PoolState>,
    available: Notify,
}

impl PoolShared {
    pub(crate) fn host(&self) -> &str {
        &self.config.name
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return a borrowed session's slot, re-idling the session when allowed
    pub(crate) fn return_session(&self, session: Session, keep: bool) {
        let to_close = {
            let mut state = self.lock_state();
            state.borrowed = state.borrowed.saturating_sub(1);
            if keep && session.is_healthy() && !state.closed {
                state.idle.push_back(session);
                self.record_occupancy(&state);
                None
            } else {
                self.record_occupancy(&state);
                Some(session)
            }
        };

        if let Some(session) = to_close {
            debug!(host = %self.host(), session_id = session.id(), "Closing session");
            session.close();
            metrics::record_session_closed(self.host());
        }

        self.available.notify_one();
    }

    fn free_slot(&self) {
        {
            let mut state = self.lock_state();
            state.borrowed = state.borrowed.saturating_sub(1);
            self.record_occupancy(&state);
        }
        self.available.notify_one();
    }

    fn record_occupancy(&self, state: &PoolState) {
        metrics::record_pool_occupancy(self.host(), state.idle.len(), state.borrowed);
    }
}

/// A reserved pool slot not yet bound to a session
struct Slot {
    shared: Arc<PoolShared>,
    held: bool,
}

impl Slot {
    fn into_session(mut self, session: Session) -> PooledSession {
        self.held = false;
        PooledSession::new(session, self.shared.clone())
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if self.held {
            self.shared.free_slot();
        }
    }
}

enum Step {
    Reuse(Slot, Session),
    Open(Slot),
    Wait,
}

/// Pool of authenticated sessions to one remote host
pub struct SessionPool {
    shared: Arc<PoolShared>,
    connector: Arc<dyn Connector>,
    next_id: AtomicU64,
}

impl SessionPool {
    pub fn new(config: RemoteHostConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                config: Arc::new(config),
                state: Mutex::new(PoolState::default()),
                available: Notify::new(),
            }),
            connector,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn host(&self) -> &str {
        self.shared.host()
    }

    pub fn config(&self) -> &RemoteHostConfig {
        &self.shared.config
    }

    /// Borrow a session, waiting for capacity until the configured acquire timeout
    pub async fn acquire_default(&self) -> Result<PooledSession, RemoteError> {
        self.acquire(Instant::now() + self.shared.config.acquire_timeout())
            .await
    }

    /// Borrow a session, waiting for capacity until `deadline`
    pub async fn acquire(&self, deadline: Instant) -> Result<PooledSession, RemoteError> {
        let started = Instant::now();
        let max_size = self.shared.config.max_pool_size;

        loop {
            let notified = self.shared.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut state = self.shared.lock_state();
                if state.closed {
                    return Err(RemoteError::PoolClosed(self.host().to_string()));
                }
                if let Some(session) = state.idle.pop_back() {
                    state.borrowed += 1;
                    self.shared.record_occupancy(&state);
                    Step::Reuse(self.slot(), session)
                } else if state.idle.len() + state.borrowed < max_size {
                    state.borrowed += 1;
                    self.shared.record_occupancy(&state);
                    Step::Open(self.slot())
                } else {
                    Step::Wait
                }
            };

            match step {
                Step::Reuse(slot, session) => {
                    metrics::record_pool_acquire(self.host(), "reused");
                    return self.hand_out(slot, session, deadline).await;
                }
                Step::Open(slot) => {
                    metrics::record_pool_acquire(self.host(), "opened");
                    return self.open(slot, deadline).await;
                }
                Step::Wait => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        let waited = started.elapsed();
                        warn!(host = %self.host(), waited_ms = waited.as_millis() as u64, "Session pool exhausted");
                        metrics::record_pool_acquire(self.host(), "exhausted");
                        return Err(RemoteError::PoolExhausted {
                            host: self.host().to_string(),
                            waited,
                        });
                    }
                }
            }
        }
    }

    /// Return a session after a successful command
    pub fn release(&self, session: PooledSession) {
        debug_assert!(session.belongs_to(&self.shared));
        session.finish(true);
    }

    /// Close a session whose transport can no longer be trusted
    pub fn invalidate(&self, session: PooledSession) {
        debug_assert!(session.belongs_to(&self.shared));
        warn!(host = %self.host(), session_id = session.id(), "Invalidating session");
        session.finish(false);
    }

    /// Open a throwaway session and probe it; pool accounting is untouched
    pub async fn test_connectivity(&self) -> bool {
        let timeout = self.shared.config.connect_timeout();
        let transport =
            match tokio::time::timeout(timeout, self.connector.connect(&self.shared.config)).await {
                Ok(Ok(transport)) => transport,
                Ok(Err(e)) => {
                    warn!(host = %self.host(), error = %e, "Connectivity check failed");
                    return false;
                }
                Err(_) => {
                    warn!(host = %self.host(), "Connectivity check timed out");
                    return false;
                }
            };

        let ok = tokio::time::timeout(timeout, transport.probe())
            .await
            .unwrap_or(false);
        transport.close();
        ok
    }

    /// Close idle sessions and refuse further acquires
    pub async fn shutdown(&self) {
        let drained: Vec<Session> = {
            let mut state = self.shared.lock_state();
            state.closed = true;
            let drained = state.idle.drain(..).collect();
            self.shared.record_occupancy(&state);
            drained
        };

        let count = drained.len();
        for session in drained {
            session.close();
            metrics::record_session_closed(self.host());
        }
        self.shared.available.notify_waiters();

        info!(host = %self.host(), closed = count, "Session pool shut down");
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.shared.lock_state();
        PoolStatus {
            idle: state.idle.len(),
            borrowed: state.borrowed,
            total_created: state.total_created,
            max_size: self.shared.config.max_pool_size,
        }
    }

    fn slot(&self) -> Slot {
        Slot {
            shared: self.shared.clone(),
            held: true,
        }
    }

    /// Hand out an idle session, probing it first if it has gone stale
    async fn hand_out(
        &self,
        slot: Slot,
        mut session: Session,
        deadline: Instant,
    ) -> Result<PooledSession, RemoteError> {
        if !session.needs_validation(self.shared.config.idle_validate_after()) {
            return Ok(slot.into_session(session));
        }

        let probe_deadline = deadline.min(Instant::now() + self.shared.config.connect_timeout());
        let alive = tokio::time::timeout_at(probe_deadline, session.transport().probe())
            .await
            .unwrap_or(false);

        if alive {
            session.touch();
            return Ok(slot.into_session(session));
        }

        warn!(host = %self.host(), session_id = session.id(), "Stale session failed probe, replacing");
        session.close();
        metrics::record_session_closed(self.host());
        self.open(slot, deadline).await
    }

    /// Open a new session in an already reserved slot
    async fn open(&self, slot: Slot, deadline: Instant) -> Result<PooledSession, RemoteError> {
        let connect_deadline = deadline.min(Instant::now() + self.shared.config.connect_timeout());
        let connected =
            tokio::time::timeout_at(connect_deadline, self.connector.connect(&self.shared.config))
                .await;

        let transport = match connected {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => {
                metrics::record_connect_failure(self.host());
                return Err(RemoteError::Connection {
                    host: self.host().to_string(),
                    message: e.to_string(),
                });
            }
            Err(_) => {
                metrics::record_connect_failure(self.host());
                return Err(RemoteError::Connection {
                    host: self.host().to_string(),
                    message: "connect timed out".to_string(),
                });
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.shared.lock_state();
            state.total_created += 1;
        }
        metrics::record_session_opened(self.host());
        debug!(host = %self.host(), session_id = id, "Opened session");

        Ok(slot.into_session(Session::new(id, transport)))
    }
}

/// Session pools for every configured host, owned by the composition root
pub struct PoolRegistry {
    pools: HashMap<String, Arc<SessionPool>>,
}

impl PoolRegistry {
    pub fn new(hosts: &[RemoteHostConfig], connector: Arc<dyn Connector>) -> Self {
        let pools = hosts
            .iter()
            .map(|host| {
                (
                    host.name.clone(),
                    Arc::new(SessionPool::new(host.clone(), connector.clone())),
                )
            })
            .collect();
        Self { pools }
    }

    pub fn pool(&self, host: &str) -> Result<Arc<SessionPool>, RemoteError> {
        self.pools
            .get(host)
            .cloned()
            .ok_or_else(|| RemoteError::UnknownHost(host.to_string()))
    }

    pub fn pools(&self) -> impl Iterator<Item = &Arc<SessionPool>> {
        self.pools.values()
    }

    pub async fn shutdown_all(&self) {
        for pool in self.pools.values() {
            pool.shutdown().await;
        }
    }
}
