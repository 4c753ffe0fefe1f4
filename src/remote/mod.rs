//! Remote shell plumbing
//!
//! Handles everything between a rendered command line and a remote host:
//! - Authenticated sessions over SSH
//! - A bounded per-host session pool
//! - Command execution with deadlines and failure classification

mod command;
mod executor;
mod pool;
mod session;
mod ssh;

pub use command::{shell_quote, RemoteCommand};
pub use executor::CommandExecutor;
pub use pool::{PoolRegistry, PoolStatus, SessionPool};
pub use session::{PooledSession, Session};
pub use ssh::SshConnector;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::RemoteHostConfig;
use crate::models::CommandResult;

/// Failure of the underlying connection, as opposed to a command exiting non-zero
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// An open, authenticated connection able to run command lines
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run a command line and collect its output
    async fn exec(&self, command_line: &str) -> Result<CommandResult, TransportError>;

    /// Lightweight liveness check
    async fn probe(&self) -> bool {
        matches!(self.exec("true").await, Ok(result) if result.success())
    }

    /// Best-effort close; must not block on in-flight commands
    fn close(&self);
}

/// Opens transports to a configured host
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &RemoteHostConfig) -> Result<Box<dyn Transport>, TransportError>;
}
