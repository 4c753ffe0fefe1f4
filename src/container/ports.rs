//! Host port selection

use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::error::ProvisionError;
use crate::persistence::InstanceRepository;

/// Picks free host ports for one remote host
///
/// The record set in the repository is the source of truth. Ports handed out
/// to creations that have not persisted their record yet are held in an
/// in-process reservation set until the lease is dropped.
#[derive(Clone)]
pub struct PortAllocator {
    host: String,
    range: RangeInclusive<u16>,
    reserved: Arc<Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    pub fn new(host: impl Into<String>, range: RangeInclusive<u16>) -> Self {
        Self {
            host: host.into(),
            range,
            reserved: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<u16>> {
        self.reserved.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lowest port in range that is neither recorded nor reserved
    pub async fn allocate(
        &self,
        repository: &dyn InstanceRepository,
    ) -> Result<PortLease, ProvisionError> {
        for port in self.range.clone() {
            if !self.lock().insert(port) {
                continue;
            }
            let lease = PortLease {
                port,
                reserved: self.reserved.clone(),
            };

            if repository.is_port_in_use(&self.host, port).await? {
                continue;
            }

            debug!(host = %self.host, port, "Allocated host port");
            return Ok(lease);
        }

        Err(ProvisionError::Provisioning(format!(
            "no free port in {}-{} on {}",
            self.range.start(),
            self.range.end(),
            self.host
        )))
    }

    pub fn reserved_count(&self) -> usize {
        self.lock().len()
    }
}

/// A reserved port; the reservation ends when the lease is dropped
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    reserved: Arc<Mutex<HashSet<u16>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.port);
    }
}
