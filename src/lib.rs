//! DBaaS provisioning engine
//!
//! Turns "create instance" requests into containerized databases on remote
//! hosts and manages them afterwards, all over pooled SSH sessions.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

pub mod collector;
pub mod config;
pub mod container;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod notify;
pub mod persistence;
pub mod remote;

#[cfg(test)]
mod test_support;

use crate::collector::StatsCollector;
use crate::config::AppConfig;
use crate::container::DriverRegistry;
use crate::lifecycle::InstanceLifecycleManager;
use crate::notify::Notifier;
use crate::persistence::InstanceRepository;
use crate::remote::{Connector, PoolRegistry, PoolStatus};

/// Reachability and pool accounting of one host
#[derive(Debug, Clone, Serialize)]
pub struct HostHealth {
    pub host: String,
    pub reachable: bool,
    pub pool: PoolStatus,
}

/// Every component wired together; owned by the binary or an embedding service
pub struct ProvisioningEngine {
    pub config: AppConfig,
    pub pools: Arc<PoolRegistry>,
    pub drivers: Arc<DriverRegistry>,
    pub repository: Arc<dyn InstanceRepository>,
    pub lifecycle: Arc<InstanceLifecycleManager>,
    pub collector: Arc<StatsCollector>,
}

impl ProvisioningEngine {
    pub fn build(
        config: AppConfig,
        connector: Arc<dyn Connector>,
        repository: Arc<dyn InstanceRepository>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let placement = config
            .placement_host()
            .context("No remote host configured")?
            .to_string();

        let pools = Arc::new(PoolRegistry::new(&config.hosts, connector));
        let drivers = Arc::new(DriverRegistry::new(
            &pools,
            &config.provisioning,
            config.collector.log_tail_lines,
        ));
        let lifecycle = Arc::new(InstanceLifecycleManager::new(
            repository.clone(),
            notifier,
            drivers.clone(),
            placement.clone(),
            config.provisioning.clone(),
        ));
        let collector = Arc::new(StatsCollector::new(
            repository.clone(),
            drivers.clone(),
            config.provisioning.command_timeout(),
        ));

        info!(hosts = config.hosts.len(), placement = %placement, "Provisioning engine ready");

        Ok(Self {
            config,
            pools,
            drivers,
            repository,
            lifecycle,
            collector,
        })
    }

    /// Probe every configured host
    pub async fn check_hosts(&self) -> Vec<HostHealth> {
        let checks = self.pools.pools().map(|pool| async move {
            HostHealth {
                host: pool.host().to_string(),
                reachable: pool.test_connectivity().await,
                pool: pool.status(),
            }
        });
        let mut health = futures::future::join_all(checks).await;
        health.sort_by(|a, b| a.host.cmp(&b.host));
        health
    }

    pub fn collector_interval(&self) -> Duration {
        Duration::from_secs(self.config.collector.interval_secs)
    }

    pub async fn shutdown(&self) {
        self.pools.shutdown_all().await;
        info!("Provisioning engine stopped");
    }
}
