//! Stats and log collection
//!
//! Reads resource usage and logs of instance containers. Collection failures
//! are logged and counted; they never change an instance's status.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::container::{ContainerHandle, DriverRegistry};
use crate::error::{ProvisionError, Result};
use crate::metrics;
use crate::models::{InstanceRecord, InstanceStatus, LogEntry, StatsSnapshot};
use crate::persistence::InstanceRepository;

/// Result of one sweep over all running instances
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CollectionSummary {
    pub sampled: usize,
    pub failed: usize,
}

pub struct StatsCollector {
    repository: Arc<dyn InstanceRepository>,
    drivers: Arc<DriverRegistry>,
    timeout: Duration,
}

impl StatsCollector {
    pub fn new(
        repository: Arc<dyn InstanceRepository>,
        drivers: Arc<DriverRegistry>,
        timeout: Duration,
    ) -> Self {
        Self {
            repository,
            drivers,
            timeout,
        }
    }

    async fn load(&self, id: Uuid) -> Result<InstanceRecord> {
        self.repository
            .load_instance(id)
            .await?
            .ok_or(ProvisionError::NotFound(id))
    }

    /// Current resource usage of a running instance
    pub async fn collect(&self, instance_id: Uuid) -> Result<StatsSnapshot> {
        let record = self.load(instance_id).await?;
        if record.status != InstanceStatus::Running {
            return Err(ProvisionError::NotRunning {
                instance_id,
                status: record.status,
            });
        }
        self.sample(&record).await
    }

    async fn sample(&self, record: &InstanceRecord) -> Result<StatsSnapshot> {
        let driver = self.drivers.get(&record.host)?;
        let handle = ContainerHandle::named(record.container_name.clone());
        let deadline = Instant::now() + self.timeout;

        match driver.read_stats(record.id, &handle, deadline).await {
            Ok(snapshot) => {
                metrics::record_instance_usage(&snapshot);
                debug!(instance_id = %record.id, cpu = snapshot.cpu_percent, memory_mb = snapshot.memory_used_mb, "Stats collected");
                Ok(snapshot)
            }
            Err(e) => {
                metrics::record_stats_failure(&record.host);
                warn!(instance_id = %record.id, host = %record.host, error = %e, "Stats collection failed");
                Err(e)
            }
        }
    }

    /// Container logs, optionally only those after `since`
    pub async fn collect_logs(
        &self,
        instance_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<LogEntry>> {
        let record = self.load(instance_id).await?;
        if !matches!(
            record.status,
            InstanceStatus::Running | InstanceStatus::Suspended
        ) {
            return Err(ProvisionError::NotRunning {
                instance_id,
                status: record.status,
            });
        }

        let driver = self.drivers.get(&record.host)?;
        let handle = ContainerHandle::named(record.container_name.clone());
        let deadline = Instant::now() + self.timeout;

        driver
            .read_logs(&handle, since, deadline)
            .await
            .map_err(|e| {
                warn!(instance_id = %instance_id, host = %record.host, error = %e, "Log collection failed");
                e
            })
    }

    /// Sample every running instance and store the snapshots
    pub async fn collect_all(&self) -> Result<CollectionSummary> {
        let running: Vec<InstanceRecord> = self
            .repository
            .list_instances()
            .await?
            .into_iter()
            .filter(|r| r.status == InstanceStatus::Running)
            .collect();

        let results = join_all(running.iter().map(|record| self.sample(record))).await;

        let mut summary = CollectionSummary::default();
        for result in results {
            match result {
                Ok(snapshot) => match self.repository.append_stats(&snapshot).await {
                    Ok(()) => summary.sampled += 1,
                    Err(e) => {
                        warn!(instance_id = %snapshot.instance_id, error = %e, "Failed to store stats");
                        summary.failed += 1;
                    }
                },
                Err(_) => summary.failed += 1,
            }
        }

        debug!(sampled = summary.sampled, failed = summary.failed, "Stats sweep complete");
        Ok(summary)
    }

    /// Run [`collect_all`](Self::collect_all) every `interval` until the task is aborted
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        info!(interval_secs = interval.as_secs(), "Starting periodic stats collection");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.collect_all().await {
                    warn!(error = %e, "Stats sweep failed");
                }
            }
        })
    }
}
