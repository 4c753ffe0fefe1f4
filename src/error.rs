//! Error types for the provisioning engine
//!
//! Transport-level failures (`RemoteError`, `CommandError`) are kept apart from
//! logical ones (`ProvisionError::Provisioning`, `IllegalTransition`, ...) so
//! that retry decisions can be made on the type alone.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::lifecycle::TransitionEvent;
use crate::models::InstanceStatus;

/// Classification of a failed remote command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandErrorKind {
    Timeout,
    Transport,
}

/// A single remote command failed below the level of its exit code
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    #[error("command `{program}` timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("transport failure while running `{program}`: {message}")]
    Transport { program: String, message: String },
}

impl CommandError {
    pub fn kind(&self) -> CommandErrorKind {
        match self {
            CommandError::Timeout { .. } => CommandErrorKind::Timeout,
            CommandError::Transport { .. } => CommandErrorKind::Transport,
        }
    }
}

/// Failures of the session pool and the command layer
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("failed to connect to {host}: {message}")]
    Connection { host: String, message: String },

    #[error("session pool for {host} exhausted after waiting {waited:?}")]
    PoolExhausted { host: String, waited: Duration },

    #[error("session pool for {0} is shut down")]
    PoolClosed(String),

    #[error("no remote host configured with name {0}")]
    UnknownHost(String),

    #[error(transparent)]
    Command(#[from] CommandError),
}

impl RemoteError {
    /// Whether a retry on a fresh session may succeed
    pub fn is_transport(&self) -> bool {
        matches!(self, RemoteError::Connection { .. } | RemoteError::Command(_))
    }
}

/// Persistence collaborator failure
#[derive(Debug, Clone, Error)]
#[error("repository error: {0}")]
pub struct RepositoryError(pub String);

impl From<std::io::Error> for RepositoryError {
    fn from(err: std::io::Error) -> Self {
        RepositoryError(err.to_string())
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError(err.to_string())
    }
}

/// Errors surfaced by the lifecycle manager and the collector
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("illegal transition for instance {instance_id}: {event} from {from}")]
    IllegalTransition {
        instance_id: Uuid,
        from: InstanceStatus,
        event: TransitionEvent,
    },

    #[error("instance {0} already has a transition in progress")]
    ConflictingOperation(Uuid),

    #[error("instance not found: {0}")]
    NotFound(Uuid),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("instance {instance_id} is {status}, expected running")]
    NotRunning {
        instance_id: Uuid,
        status: InstanceStatus,
    },

    #[error(transparent)]
    Persistence(#[from] RepositoryError),

    #[error("credential error: {0}")]
    Credential(String),
}

impl ProvisionError {
    /// Whether the failure happened at the transport level
    pub fn is_transport(&self) -> bool {
        matches!(self, ProvisionError::Remote(e) if e.is_transport())
    }
}

impl From<CommandError> for ProvisionError {
    fn from(err: CommandError) -> Self {
        ProvisionError::Remote(RemoteError::Command(err))
    }
}

pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        let timeout = RemoteError::Command(CommandError::Timeout {
            program: "docker".to_string(),
            timeout: Duration::from_secs(1),
        });
        assert!(timeout.is_transport());

        let exhausted = RemoteError::PoolExhausted {
            host: "db-1".to_string(),
            waited: Duration::from_secs(5),
        };
        assert!(!exhausted.is_transport());

        let logical = ProvisionError::Provisioning("image missing".to_string());
        assert!(!logical.is_transport());
        assert!(ProvisionError::from(timeout).is_transport());
    }

    #[test]
    fn test_command_error_kind() {
        let err = CommandError::Transport {
            program: "docker".to_string(),
            message: "broken pipe".to_string(),
        };
        assert_eq!(err.kind(), CommandErrorKind::Transport);
        assert!(err.to_string().contains("broken pipe"));
    }
}
