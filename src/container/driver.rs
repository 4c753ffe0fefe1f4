//! Docker container lifecycle on a remote host

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::logs::parse_logs;
use super::ports::{PortAllocator, PortLease};
use super::stats::parse_stats;
use crate::config::{ProvisioningConfig, ResourceLimits};
use crate::error::{ProvisionError, RemoteError, Result};
use crate::models::{CommandResult, Credential, Engine, LogEntry, StatsSnapshot};
use crate::persistence::InstanceRepository;
use crate::remote::{CommandExecutor, PoolRegistry, RemoteCommand};

/// Deterministic container name for an instance
pub fn container_name(engine: Engine, instance_id: Uuid) -> String {
    format!("dbaas-{}-{}", engine.as_str(), instance_id.simple())
}

/// Everything needed to create an instance container
#[derive(Debug)]
pub struct ContainerSpec<'a> {
    pub instance_id: Uuid,
    pub name: String,
    pub engine: Engine,
    pub image: String,
    pub host_port: u16,
    pub credential: &'a Credential,
}

/// Reference to a container on the remote host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub name: String,
    pub id: Option<String>,
}

impl ContainerHandle {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
        }
    }
}

/// Driver settings derived from the provisioning configuration
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub docker_binary: String,
    pub stop_timeout_secs: u64,
    pub limits: ResourceLimits,
    pub log_tail_lines: usize,
}

impl DriverSettings {
    pub fn from_config(config: &ProvisioningConfig, log_tail_lines: usize) -> Self {
        Self {
            docker_binary: config.docker_binary.clone(),
            stop_timeout_secs: config.stop_timeout_secs,
            limits: config.limits.clone(),
            log_tail_lines,
        }
    }
}

const CONFLICT_MARKERS: &[&str] = &["is already in use", "Conflict."];
const NOT_FOUND_MARKERS: &[&str] = &["No such container", "no such container"];

fn stderr_has(result: &CommandResult, markers: &[&str]) -> bool {
    markers.iter().any(|m| result.stderr.contains(m))
}

fn failure(action: &str, name: &str, result: &CommandResult) -> ProvisionError {
    ProvisionError::Provisioning(format!(
        "docker {} {} failed (exit {}): {}",
        action,
        name,
        result.exit_code,
        result.stderr.trim()
    ))
}

/// Issues docker commands for one host
pub struct RemoteContainerDriver {
    executor: CommandExecutor,
    settings: DriverSettings,
    ports: PortAllocator,
}

impl RemoteContainerDriver {
    pub fn new(executor: CommandExecutor, settings: DriverSettings, ports: PortAllocator) -> Self {
        Self {
            executor,
            settings,
            ports,
        }
    }

    pub fn host(&self) -> &str {
        self.executor.host()
    }

    /// Address clients use to reach published ports
    pub fn address(&self) -> &str {
        &self.executor.pool().config().address
    }

    /// Reserve a host port not used by any live instance on this host
    pub async fn allocate_port(&self, repository: &dyn InstanceRepository) -> Result<PortLease> {
        self.ports.allocate(repository).await
    }

    fn docker(&self) -> RemoteCommand {
        RemoteCommand::from_binary(&self.settings.docker_binary)
    }

    /// Run a command, retrying once on a transport-class failure
    async fn run_with_retry(
        &self,
        command: &RemoteCommand,
        deadline: Instant,
    ) -> Result<CommandResult, RemoteError> {
        match self.executor.execute(command, deadline).await {
            Err(e) if e.is_transport() && Instant::now() < deadline => {
                warn!(host = %self.host(), command = %command, error = %e, "Retrying after transport failure");
                self.executor.execute(command, deadline).await
            }
            other => other,
        }
    }

    /// `docker create`; an existing container with the same name counts as success
    pub async fn create_container(
        &self,
        spec: &ContainerSpec<'_>,
        deadline: Instant,
    ) -> Result<ContainerHandle> {
        let limits = &self.settings.limits;
        let mut command = self
            .docker()
            .args(["create", "--name", spec.name.as_str()])
            .arg("--label")
            .arg("dbaas.managed=true")
            .arg("--label")
            .arg(format!("dbaas.instance={}", spec.instance_id))
            .arg("--label")
            .arg(format!("dbaas.engine={}", spec.engine))
            .args(["--restart", "unless-stopped"])
            .arg("--memory")
            .arg(format!("{}m", limits.max_memory_mb))
            .arg("--cpus")
            .arg(format!("{}", limits.max_cpus))
            .arg("--pids-limit")
            .arg(format!("{}", limits.max_pids))
            .arg("-p")
            .arg(format!("{}:{}", spec.host_port, spec.engine.container_port()));

        for (key, value) in spec.engine.credential_env(spec.credential) {
            command = command.arg("-e").secret_arg(format!("{}={}", key, value));
        }

        command = command.arg(spec.image.as_str());
        for arg in spec.engine.command_args(spec.credential) {
            if arg == spec.credential.password {
                command = command.secret_arg(arg);
            } else {
                command = command.arg(arg);
            }
        }

        let result = self.run_with_retry(&command, deadline).await?;

        if result.success() {
            let id = result.stdout.trim().to_string();
            info!(host = %self.host(), container = %spec.name, port = spec.host_port, "Container created");
            return Ok(ContainerHandle {
                name: spec.name.clone(),
                id: (!id.is_empty()).then_some(id),
            });
        }

        if stderr_has(&result, CONFLICT_MARKERS) {
            debug!(host = %self.host(), container = %spec.name, "Container already exists");
            return self.inspect(&spec.name, deadline).await;
        }

        Err(failure("create", &spec.name, &result))
    }

    async fn inspect(&self, name: &str, deadline: Instant) -> Result<ContainerHandle> {
        let command = self
            .docker()
            .args(["inspect", "--format", "{{.Id}}", name]);
        let result = self.run_with_retry(&command, deadline).await?;
        if !result.success() {
            return Err(failure("inspect", name, &result));
        }
        Ok(ContainerHandle {
            name: name.to_string(),
            id: Some(result.stdout.trim().to_string()),
        })
    }

    /// Starting a running container is a no-op success
    pub async fn start_container(&self, handle: &ContainerHandle, deadline: Instant) -> Result<()> {
        let command = self.docker().args(["start", handle.name.as_str()]);
        let result = self.run_with_retry(&command, deadline).await?;
        if !result.success() {
            return Err(failure("start", &handle.name, &result));
        }
        info!(host = %self.host(), container = %handle.name, "Container started");
        Ok(())
    }

    pub async fn stop_container(&self, handle: &ContainerHandle, deadline: Instant) -> Result<()> {
        let command = self
            .docker()
            .arg("stop")
            .arg("-t")
            .arg(self.settings.stop_timeout_secs.to_string())
            .arg(handle.name.as_str());
        let result = self.run_with_retry(&command, deadline).await?;
        if !result.success() {
            return Err(failure("stop", &handle.name, &result));
        }
        info!(host = %self.host(), container = %handle.name, "Container stopped");
        Ok(())
    }

    /// Force-remove the container and its anonymous volumes; a missing container is fine
    pub async fn remove_container(&self, handle: &ContainerHandle, deadline: Instant) -> Result<()> {
        let command = self.docker().args(["rm", "-f", "-v", handle.name.as_str()]);
        let result = self.run_with_retry(&command, deadline).await?;
        if result.success() {
            info!(host = %self.host(), container = %handle.name, "Container removed");
            return Ok(());
        }
        if stderr_has(&result, NOT_FOUND_MARKERS) {
            debug!(host = %self.host(), container = %handle.name, "Container already gone");
            return Ok(());
        }
        Err(failure("rm", &handle.name, &result))
    }

    pub async fn read_stats(
        &self,
        instance_id: Uuid,
        handle: &ContainerHandle,
        deadline: Instant,
    ) -> Result<StatsSnapshot> {
        let command = self.docker().args([
            "stats",
            "--no-stream",
            "--format",
            "{{json .}}",
            handle.name.as_str(),
        ]);
        let result = self.run_with_retry(&command, deadline).await?;
        if !result.success() {
            return Err(failure("stats", &handle.name, &result));
        }
        parse_stats(instance_id, &handle.name, &result.stdout).map_err(|e| {
            ProvisionError::Provisioning(format!("stats for {}: {}", handle.name, e))
        })
    }

    /// Recent log lines, optionally only those after `since`
    pub async fn read_logs(
        &self,
        handle: &ContainerHandle,
        since: Option<DateTime<Utc>>,
        deadline: Instant,
    ) -> Result<Vec<LogEntry>> {
        let mut command = self
            .docker()
            .args(["logs", "--timestamps", "--tail"])
            .arg(self.settings.log_tail_lines.to_string());
        if let Some(since) = since {
            command = command
                .arg("--since")
                .arg(since.to_rfc3339_opts(SecondsFormat::Secs, true));
        }
        command = command.arg(handle.name.as_str());

        let result = self.run_with_retry(&command, deadline).await?;
        if !result.success() {
            return Err(failure("logs", &handle.name, &result));
        }
        Ok(parse_logs(&result.stdout, &result.stderr))
    }
}

/// One driver per configured host
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<RemoteContainerDriver>>,
}

impl DriverRegistry {
    pub fn new(
        pools: &PoolRegistry,
        config: &ProvisioningConfig,
        log_tail_lines: usize,
    ) -> Self {
        let settings = DriverSettings::from_config(config, log_tail_lines);
        let drivers = pools
            .pools()
            .map(|pool| {
                let host = pool.host().to_string();
                let executor = CommandExecutor::new(pool.clone(), config.command_timeout());
                let ports = PortAllocator::new(
                    host.clone(),
                    config.port_range_start..=config.port_range_end,
                );
                let driver = RemoteContainerDriver::new(executor, settings.clone(), ports);
                (host, Arc::new(driver))
            })
            .collect();
        Self { drivers }
    }

    pub fn get(&self, host: &str) -> Result<Arc<RemoteContainerDriver>> {
        self.drivers
            .get(host)
            .cloned()
            .ok_or_else(|| RemoteError::UnknownHost(host.to_string()).into())
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.drivers.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::remote::SessionPool;
    use crate::test_support::{host_config, FakeDockerHost};

    fn driver(fake: &Arc<FakeDockerHost>) -> RemoteContainerDriver {
        let pool = Arc::new(SessionPool::new(host_config("db-1"), fake.connector()));
        let executor = CommandExecutor::new(pool, Duration::from_secs(5));
        let settings = DriverSettings::from_config(&ProvisioningConfig::default(), 50);
        RemoteContainerDriver::new(executor, settings, PortAllocator::new("db-1", 20000..=20010))
    }

    fn credential() -> Credential {
        Credential {
            username: "app_abc".to_string(),
            password: "s3cr3t-pass".to_string(),
            database: "main".to_string(),
            host: "10.0.0.1".to_string(),
            port: 20001,
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    fn spec<'a>(id: Uuid, credential: &'a Credential) -> ContainerSpec<'a> {
        ContainerSpec {
            instance_id: id,
            name: container_name(Engine::Postgres, id),
            engine: Engine::Postgres,
            image: "postgres:16-alpine".to_string(),
            host_port: 20001,
            credential,
        }
    }

    #[test]
    fn test_container_name_is_deterministic() {
        let id = Uuid::parse_str("6f1c2d3e-4b5a-6978-8a9b-0c1d2e3f4a5b").unwrap();
        assert_eq!(
            container_name(Engine::Redis, id),
            "dbaas-redis-6f1c2d3e4b5a69788a9b0c1d2e3f4a5b"
        );
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let fake = FakeDockerHost::new();
        let driver = driver(&fake);
        let cred = credential();
        let id = Uuid::new_v4();

        let first = driver.create_container(&spec(id, &cred), deadline()).await.unwrap();
        let second = driver.create_container(&spec(id, &cred), deadline()).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(fake.container_count(), 1);
    }

    #[tokio::test]
    async fn test_create_passes_credentials_and_limits() {
        let fake = FakeDockerHost::new();
        let driver = driver(&fake);
        let cred = credential();
        let id = Uuid::new_v4();

        driver.create_container(&spec(id, &cred), deadline()).await.unwrap();

        let argv = fake.executed().into_iter().find(|a| a.get(1).map(String::as_str) == Some("create")).unwrap();
        assert!(argv.contains(&"POSTGRES_PASSWORD=s3cr3t-pass".to_string()));
        assert!(argv.contains(&"1024m".to_string()));
        assert!(argv.contains(&"20001:5432".to_string()));
    }

    #[tokio::test]
    async fn test_create_retries_transport_failure_once() {
        let fake = FakeDockerHost::new();
        let driver = driver(&fake);
        let cred = credential();
        fake.fail_next_execs(1);

        driver
            .create_container(&spec(Uuid::new_v4(), &cred), deadline())
            .await
            .unwrap();
        assert_eq!(fake.container_count(), 1);
        assert_eq!(fake.connects(), 2);
    }

    #[tokio::test]
    async fn test_second_transport_failure_surfaces() {
        let fake = FakeDockerHost::new();
        let driver = driver(&fake);
        let cred = credential();
        fake.fail_next_execs(2);

        let err = driver
            .create_container(&spec(Uuid::new_v4(), &cred), deadline())
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert_eq!(fake.container_count(), 0);
    }

    #[tokio::test]
    async fn test_start_stop_remove() {
        let fake = FakeDockerHost::new();
        let driver = driver(&fake);
        let cred = credential();
        let handle = driver
            .create_container(&spec(Uuid::new_v4(), &cred), deadline())
            .await
            .unwrap();

        driver.start_container(&handle, deadline()).await.unwrap();
        assert!(fake.is_running(&handle.name));
        // Already running
        driver.start_container(&handle, deadline()).await.unwrap();

        driver.stop_container(&handle, deadline()).await.unwrap();
        assert!(!fake.is_running(&handle.name));

        driver.remove_container(&handle, deadline()).await.unwrap();
        assert_eq!(fake.container_count(), 0);
        // Removing twice is fine
        driver.remove_container(&handle, deadline()).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_missing_container_is_provisioning_error() {
        let fake = FakeDockerHost::new();
        let driver = driver(&fake);

        let err = driver
            .start_container(&ContainerHandle::named("dbaas-postgres-missing"), deadline())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Provisioning(_)));
        // Logical failures are not retried
        assert_eq!(fake.executed().len(), 1);
    }

    #[tokio::test]
    async fn test_read_stats_and_logs() {
        let fake = FakeDockerHost::new();
        let driver = driver(&fake);
        let cred = credential();
        let id = Uuid::new_v4();
        let handle = driver.create_container(&spec(id, &cred), deadline()).await.unwrap();
        driver.start_container(&handle, deadline()).await.unwrap();

        let stats = driver.read_stats(id, &handle, deadline()).await.unwrap();
        assert_eq!(stats.instance_id, id);
        assert!(stats.memory_used_mb > 0.0);

        let logs = driver.read_logs(&handle, None, deadline()).await.unwrap();
        assert!(!logs.is_empty());
    }
}
