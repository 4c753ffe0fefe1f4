//! Configuration module for the provisioning engine
//!
//! Supports configuration via:
//! - TOML/YAML config files
//! - Environment variables (with DBAAS_ prefix)

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::Engine;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Remote docker hosts managed by this process
    #[serde(default)]
    pub hosts: Vec<RemoteHostConfig>,

    /// Provisioning settings
    #[serde(default)]
    pub provisioning: ProvisioningConfig,

    /// Stats collection settings
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Metrics settings
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Notification settings
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Local storage for the file-backed instance store
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Connection settings for one remote host
#[derive(Clone, Serialize, Deserialize)]
pub struct RemoteHostConfig {
    /// Name used to reference the host from instance records
    pub name: String,

    /// Hostname or IP address
    pub address: String,

    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    pub username: String,

    /// Password authentication
    #[serde(default)]
    pub password: Option<String>,

    /// Path to a private key file
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,

    /// Inline PEM private key
    #[serde(default)]
    pub private_key: Option<String>,

    #[serde(default)]
    pub passphrase: Option<String>,

    /// Expected host key, `SHA256:<base64>` as printed by ssh-keygen
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,

    /// Idle sessions older than this are probed before reuse
    #[serde(default = "default_idle_validate_after")]
    pub idle_validate_after_secs: u64,

    /// Default wait for a free session
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

/// Resource limits applied to instance containers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum memory in megabytes
    #[serde(default = "default_memory_mb")]
    pub max_memory_mb: u64,

    /// Maximum CPU cores (can be fractional)
    #[serde(default = "default_cpus")]
    pub max_cpus: f64,

    /// Maximum number of processes
    #[serde(default = "default_pids")]
    pub max_pids: u32,
}

/// Provisioning settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    /// Host new instances are placed on (first configured host if unset)
    #[serde(default)]
    pub default_host: Option<String>,

    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Container CLI on the remote host
    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,

    /// Timeout for a single remote command
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Grace period passed to `docker stop`
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Deadline for a whole lifecycle transition
    #[serde(default = "default_operation_deadline")]
    pub operation_deadline_secs: u64,

    /// Default resource limits for instance containers
    #[serde(default)]
    pub limits: ResourceLimits,

    /// Image overrides keyed by engine name
    #[serde(default)]
    pub engine_images: HashMap<String, String>,
}

/// Stats collection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_collect_interval")]
    pub interval_secs: u64,

    /// Lines returned by a log tail
    #[serde(default = "default_log_tail")]
    pub log_tail_lines: usize,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address the exporter listens on
    #[serde(default = "default_metrics_addr")]
    pub listen_addr: String,
}

/// Notification configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Slack-compatible incoming webhook
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Local storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    60
}

fn default_max_pool_size() -> usize {
    4
}

fn default_idle_validate_after() -> u64 {
    30
}

fn default_acquire_timeout() -> u64 {
    15
}

fn default_memory_mb() -> u64 {
    1024
}

fn default_cpus() -> f64 {
    1.0
}

fn default_pids() -> u32 {
    512
}

fn default_port_range_start() -> u16 {
    20000
}

fn default_port_range_end() -> u16 {
    29999
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

fn default_command_timeout() -> u64 {
    60
}

fn default_stop_timeout() -> u64 {
    20
}

fn default_operation_deadline() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_collect_interval() -> u64 {
    60
}

fn default_log_tail() -> usize {
    200
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9464".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/dbaas")
}

impl RemoteHostConfig {
    /// Minimal password-authenticated host, other settings defaulted
    pub fn new(name: impl Into<String>, address: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port: default_ssh_port(),
            username: username.into(),
            password: None,
            private_key_path: None,
            private_key: None,
            passphrase: None,
            host_key_fingerprint: None,
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            max_pool_size: default_max_pool_size(),
            idle_validate_after_secs: default_idle_validate_after(),
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn idle_validate_after(&self) -> Duration {
        Duration::from_secs(self.idle_validate_after_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Remote host name cannot be empty");
        }
        if self.address.trim().is_empty() {
            anyhow::bail!("Remote host {} has no address", self.name);
        }
        if self.max_pool_size == 0 {
            anyhow::bail!("Remote host {} must allow at least one session", self.name);
        }
        if self.connect_timeout_secs == 0 || self.read_timeout_secs == 0 {
            anyhow::bail!("Remote host {} timeouts cannot be 0", self.name);
        }
        let has_key = self.private_key_path.is_some()
            || self.private_key.as_ref().map(|k| !k.trim().is_empty()).unwrap_or(false);
        let has_password = self.password.as_ref().map(|p| !p.is_empty()).unwrap_or(false);
        if !has_key && !has_password {
            anyhow::bail!(
                "Remote host {} needs a password or a private key",
                self.name
            );
        }
        Ok(())
    }
}

impl fmt::Debug for RemoteHostConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHostConfig")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key_path", &self.private_key_path)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("host_key_fingerprint", &self.host_key_fingerprint)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("read_timeout_secs", &self.read_timeout_secs)
            .field("max_pool_size", &self.max_pool_size)
            .finish()
    }
}

impl ProvisioningConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn operation_deadline(&self) -> Duration {
        Duration::from_secs(self.operation_deadline_secs)
    }

    /// Image for an engine, honouring overrides
    pub fn image_for(&self, engine: Engine) -> String {
        self.engine_images
            .get(engine.as_str())
            .cloned()
            .unwrap_or_else(|| engine.default_image().to_string())
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: default_memory_mb(),
            max_cpus: default_cpus(),
            max_pids: default_pids(),
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            default_host: None,
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            docker_binary: default_docker_binary(),
            command_timeout_secs: default_command_timeout(),
            stop_timeout_secs: default_stop_timeout(),
            operation_deadline_secs: default_operation_deadline(),
            limits: ResourceLimits::default(),
            engine_images: HashMap::new(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_collect_interval(),
            log_tail_lines: default_log_tail(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: default_metrics_addr(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            hosts: Vec::new(),
            provisioning: ProvisioningConfig::default(),
            collector: CollectorConfig::default(),
            metrics: MetricsConfig::default(),
            notifications: NotificationConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment variables
    pub fn load() -> Result<Self> {
        // Try to load .env file if present
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config/provisioner").required(false))
            .add_source(config::File::with_name("/etc/dbaas/provisioner").required(false))
            // Override with environment variables (DBAAS_ prefix)
            .add_source(
                config::Environment::with_prefix("DBAAS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            anyhow::bail!("At least one remote host must be configured");
        }

        for host in &self.hosts {
            host.validate()?;
        }

        let mut names: Vec<&str> = self.hosts.iter().map(|h| h.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.hosts.len() {
            anyhow::bail!("Remote host names must be unique");
        }

        let p = &self.provisioning;
        if p.port_range_start == 0 || p.port_range_start > p.port_range_end {
            anyhow::bail!(
                "Invalid port range {}-{}",
                p.port_range_start,
                p.port_range_end
            );
        }

        if let Some(ref host) = p.default_host {
            if self.host(host).is_none() {
                anyhow::bail!("Default host {} is not configured", host);
            }
        }

        for engine in p.engine_images.keys() {
            engine
                .parse::<Engine>()
                .map_err(|e| anyhow::anyhow!("Invalid engine image override: {}", e))?;
        }

        if p.command_timeout_secs == 0 || p.operation_deadline_secs == 0 {
            anyhow::bail!("Provisioning timeouts cannot be 0");
        }

        // docker stop blocks for up to the stop timeout before killing
        if p.command_timeout_secs <= p.stop_timeout_secs {
            anyhow::bail!(
                "command_timeout_secs ({}) must exceed stop_timeout_secs ({})",
                p.command_timeout_secs,
                p.stop_timeout_secs
            );
        }

        if p.limits.max_memory_mb < 64 {
            anyhow::bail!("Minimum memory limit is 64MB");
        }

        if self.collector.interval_secs == 0 {
            anyhow::bail!("Collector interval cannot be 0");
        }

        Ok(())
    }

    /// Look up a host by name
    pub fn host(&self, name: &str) -> Option<&RemoteHostConfig> {
        self.hosts.iter().find(|h| h.name == name)
    }

    /// Host new instances are placed on
    pub fn placement_host(&self) -> Option<&str> {
        self.provisioning
            .default_host
            .as_deref()
            .or_else(|| self.hosts.first().map(|h| h.name.as_str()))
    }
}
