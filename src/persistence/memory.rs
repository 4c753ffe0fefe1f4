//! In-process record store

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{InstanceRepository, StoreData};
use crate::error::RepositoryError;
use crate::models::{InstanceRecord, StatsSnapshot};

/// Keeps records in memory; used for embedding and in tests
#[derive(Default)]
pub struct MemoryInstanceStore {
    data: RwLock<StoreData>,
    fail_saves: AtomicBool,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `save_instance` calls fail
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl InstanceRepository for MemoryInstanceStore {
    async fn load_instance(&self, id: Uuid) -> Result<Option<InstanceRecord>, RepositoryError> {
        Ok(self.data.read().await.instances.get(&id).cloned())
    }

    async fn save_instance(&self, record: &InstanceRecord) -> Result<(), RepositoryError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(RepositoryError("store unavailable".to_string()));
        }
        self.data
            .write()
            .await
            .instances
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn is_port_in_use(&self, host: &str, port: u16) -> Result<bool, RepositoryError> {
        Ok(self.data.read().await.port_in_use(host, port))
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, RepositoryError> {
        Ok(self.data.read().await.sorted_instances())
    }

    async fn append_stats(&self, snapshot: &StatsSnapshot) -> Result<(), RepositoryError> {
        self.data.write().await.push_stats(snapshot);
        Ok(())
    }

    async fn recent_stats(
        &self,
        id: Uuid,
        limit: usize,
    ) -> Result<Vec<StatsSnapshot>, RepositoryError> {
        Ok(self.data.read().await.recent_stats(id, limit))
    }
}
