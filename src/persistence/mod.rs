//! Persistence collaborator
//!
//! The engine never talks to a datastore directly; it reads and writes
//! instance records through [`InstanceRepository`].

mod file;
mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryInstanceStore;

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RepositoryError;
use crate::models::{InstanceRecord, StatsSnapshot};

/// Snapshots kept per instance
pub const MAX_STATS_HISTORY: usize = 100;

#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn load_instance(&self, id: Uuid) -> Result<Option<InstanceRecord>, RepositoryError>;

    /// Insert or replace the record with the same id
    async fn save_instance(&self, record: &InstanceRecord) -> Result<(), RepositoryError>;

    /// Whether a live (non-deleted) instance on `host` holds `port`
    async fn is_port_in_use(&self, host: &str, port: u16) -> Result<bool, RepositoryError>;

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, RepositoryError>;

    async fn append_stats(&self, snapshot: &StatsSnapshot) -> Result<(), RepositoryError>;

    /// Most recent snapshots for an instance, oldest first
    async fn recent_stats(
        &self,
        id: Uuid,
        limit: usize,
    ) -> Result<Vec<StatsSnapshot>, RepositoryError>;
}

/// Record set shared by the bundled stores
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    instances: HashMap<Uuid, InstanceRecord>,
    #[serde(default)]
    stats: HashMap<Uuid, VecDeque<StatsSnapshot>>,
}

impl StoreData {
    fn port_in_use(&self, host: &str, port: u16) -> bool {
        self.instances
            .values()
            .any(|r| r.host == host && r.port == port && r.status.holds_port())
    }

    fn sorted_instances(&self) -> Vec<InstanceRecord> {
        let mut records: Vec<_> = self.instances.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    fn push_stats(&mut self, snapshot: &StatsSnapshot) {
        let history = self.stats.entry(snapshot.instance_id).or_default();
        history.push_back(snapshot.clone());
        while history.len() > MAX_STATS_HISTORY {
            history.pop_front();
        }
    }

    fn recent_stats(&self, id: Uuid, limit: usize) -> Vec<StatsSnapshot> {
        self.stats
            .get(&id)
            .map(|history| {
                let skip = history.len().saturating_sub(limit);
                history.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }
}
