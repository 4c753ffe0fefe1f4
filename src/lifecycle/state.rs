//! Instance state machine

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProvisionError;
use crate::models::InstanceStatus;

/// Events that drive instance status changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionEvent {
    CreateRequested,
    ContainerStarted,
    ProvisioningFailed,
    SuspendRequested,
    ResumeRequested,
    DeleteRequested,
}

impl TransitionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionEvent::CreateRequested => "create_requested",
            TransitionEvent::ContainerStarted => "container_started",
            TransitionEvent::ProvisioningFailed => "provisioning_failed",
            TransitionEvent::SuspendRequested => "suspend_requested",
            TransitionEvent::ResumeRequested => "resume_requested",
            TransitionEvent::DeleteRequested => "delete_requested",
        }
    }
}

impl fmt::Display for TransitionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed transition table; `None` means the move is illegal
pub fn transition(from: Option<InstanceStatus>, event: TransitionEvent) -> Option<InstanceStatus> {
    use InstanceStatus::*;
    use TransitionEvent::*;

    match (from, event) {
        (None, CreateRequested) => Some(Creating),
        (Some(Creating), ContainerStarted) => Some(Running),
        (Some(Creating), ProvisioningFailed) => Some(Deleted),
        (Some(Running), SuspendRequested) => Some(Suspended),
        (Some(Suspended), ResumeRequested) => Some(Running),
        (Some(Running), DeleteRequested) | (Some(Suspended), DeleteRequested) => Some(Deleted),
        _ => None,
    }
}

/// Like [`transition`], but reports an illegal move as an error
pub fn validate(
    instance_id: Uuid,
    from: InstanceStatus,
    event: TransitionEvent,
) -> Result<InstanceStatus, ProvisionError> {
    transition(Some(from), event).ok_or(ProvisionError::IllegalTransition {
        instance_id,
        from,
        event,
    })
}
