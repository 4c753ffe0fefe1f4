//! Single-node JSON file store
//!
//! The whole record set is rewritten on every change (temp file + rename), so
//! a crash never leaves a half-written file behind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use super::{InstanceRepository, StoreData};
use crate::error::RepositoryError;
use crate::models::{InstanceRecord, StatsSnapshot};

pub struct JsonFileStore {
    file_path: PathBuf,
    data: RwLock<StoreData>,
}

impl JsonFileStore {
    /// Open (or start) `instances.json` under `data_dir`
    pub async fn open(data_dir: &Path) -> Result<Self, RepositoryError> {
        tokio::fs::create_dir_all(data_dir).await?;
        let file_path = data_dir.join("instances.json");

        let data = if tokio::fs::try_exists(&file_path).await? {
            let content = tokio::fs::read_to_string(&file_path).await?;
            serde_json::from_str(&content)?
        } else {
            StoreData::default()
        };

        info!(
            path = %file_path.display(),
            instance_count = data.instances.len(),
            "Instance store loaded"
        );

        Ok(Self {
            file_path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    async fn persist(&self, data: &StoreData) -> Result<(), RepositoryError> {
        let json = serde_json::to_string_pretty(data)?;
        let tmp = self.file_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.file_path).await?;
        Ok(())
    }
}

#[async_trait]
impl InstanceRepository for JsonFileStore {
    async fn load_instance(&self, id: Uuid) -> Result<Option<InstanceRecord>, RepositoryError> {
        Ok(self.data.read().await.instances.get(&id).cloned())
    }

    async fn save_instance(&self, record: &InstanceRecord) -> Result<(), RepositoryError> {
        let mut data = self.data.write().await;
        let previous = data.instances.insert(record.id, record.clone());
        if let Err(e) = self.persist(&data).await {
            // Keep memory consistent with what is on disk
            match previous {
                Some(prev) => data.instances.insert(record.id, prev),
                None => data.instances.remove(&record.id),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn is_port_in_use(&self, host: &str, port: u16) -> Result<bool, RepositoryError> {
        Ok(self.data.read().await.port_in_use(host, port))
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, RepositoryError> {
        Ok(self.data.read().await.sorted_instances())
    }

    async fn append_stats(&self, snapshot: &StatsSnapshot) -> Result<(), RepositoryError> {
        let mut data = self.data.write().await;
        let id = snapshot.instance_id;
        let previous = data.stats.get(&id).cloned();
        data.push_stats(snapshot);
        if let Err(e) = self.persist(&data).await {
            match previous {
                Some(history) => data.stats.insert(id, history),
                None => data.stats.remove(&id),
            };
            return Err(e);
        }
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
