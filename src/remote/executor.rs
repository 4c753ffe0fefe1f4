//! Command execution over pooled sessions

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{CommandError, RemoteError};
use crate::metrics;
use crate::models::CommandResult;

use super::{PooledSession, RemoteCommand, SessionPool};

/// Runs commands on one host, borrowing sessions from its pool
///
/// A non-zero exit status is a normal result and is handed back to the
/// caller; only timeouts and transport failures are errors. A session that
/// saw either of those is invalidated instead of returned to the pool.
#[derive(Clone)]
pub struct CommandExecutor {
    pool: Arc<SessionPool>,
    command_timeout: Duration,
}

impl CommandExecutor {
    pub fn new(pool: Arc<SessionPool>, command_timeout: Duration) -> Self {
        Self {
            pool,
            command_timeout,
        }
    }

    pub fn host(&self) -> &str {
        self.pool.host()
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Run `command` on an already borrowed session
    pub async fn run(
        &self,
        session: &mut PooledSession,
        command: &RemoteCommand,
        timeout: Duration,
    ) -> Result<CommandResult, CommandError> {
        let started = Instant::now();
        let line = command.render();
        debug!(host = %self.host(), session_id = session.id(), command = %command, "Running remote command");

        let outcome = tokio::time::timeout(timeout, session.transport().exec(&line)).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(result)) => {
                session.touch();
                metrics::record_command(self.host(), command.program(), "completed", elapsed);
                if !result.success() {
                    debug!(
                        host = %self.host(),
                        command = %command,
                        exit_code = result.exit_code,
                        "Remote command exited non-zero"
                    );
                }
                Ok(result)
            }
            Ok(Err(e)) => {
                session.mark_unhealthy();
                metrics::record_command(self.host(), command.program(), "transport_error", elapsed);
                warn!(host = %self.host(), command = %command, error = %e, "Remote command transport failure");
                Err(CommandError::Transport {
                    program: command.program().to_string(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                session.mark_unhealthy();
                metrics::record_command(self.host(), command.program(), "timeout", elapsed);
                warn!(host = %self.host(), command = %command, timeout_ms = timeout.as_millis() as u64, "Remote command timed out");
                Err(CommandError::Timeout {
                    program: command.program().to_string(),
                    timeout,
                })
            }
        }
    }

    /// Borrow a session, run `command` and hand the session back
    ///
    /// The command gets the smaller of the configured command timeout and
    /// whatever is left until `deadline`.
    pub async fn execute(
        &self,
        command: &RemoteCommand,
        deadline: Instant,
    ) -> Result<CommandResult, RemoteError> {
        let now = Instant::now();
        if deadline <= now {
            return Err(CommandError::Timeout {
                program: command.program().to_string(),
                timeout: Duration::ZERO,
            }
            .into());
        }

        let mut session = self.pool.acquire(deadline).await?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let timeout = self.command_timeout.min(remaining);

        match self.run(&mut session, command, timeout).await {
            Ok(result) => {
                self.pool.release(session);
                Ok(result)
            }
            Err(e) => {
                self.pool.invalidate(session);
                Err(e.into())
            }
        }
    }
}
