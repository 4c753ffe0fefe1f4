//! Per-instance serialization of transitions

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use crate::error::ProvisionError;

/// Instance ids with a transition in progress
#[derive(Clone, Default)]
pub struct InFlight {
    ids: Arc<Mutex<HashSet<Uuid>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `id`, failing fast if another transition holds it
    pub fn begin(&self, id: Uuid) -> Result<TransitionGuard, ProvisionError> {
        if !self.lock().insert(id) {
            return Err(ProvisionError::ConflictingOperation(id));
        }
        Ok(TransitionGuard {
            id,
            ids: self.ids.clone(),
        })
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.lock().contains(&id)
    }
}

/// Releases the claim on drop, including when the operation is cancelled
pub struct TransitionGuard {
    id: Uuid,
    ids: Arc<Mutex<HashSet<Uuid>>>,
}

impl Drop for TransitionGuard {
    fn drop(&mut self) {
        self.ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.id);
    }
}
