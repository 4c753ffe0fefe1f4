//! Data models for the provisioning engine
//!
//! Instance records, credentials, resource snapshots and the events handed to
//! the notification collaborator.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Engines
// ============================================================================

/// Supported database engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Postgres,
    Mysql,
    Mariadb,
    Mongodb,
    Redis,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Postgres => "postgres",
            Engine::Mysql => "mysql",
            Engine::Mariadb => "mariadb",
            Engine::Mongodb => "mongodb",
            Engine::Redis => "redis",
        }
    }

    /// Image used when no override is configured
    pub fn default_image(&self) -> &'static str {
        match self {
            Engine::Postgres => "postgres:16-alpine",
            Engine::Mysql => "mysql:8.0",
            Engine::Mariadb => "mariadb:11",
            Engine::Mongodb => "mongo:7",
            Engine::Redis => "redis:7-alpine",
        }
    }

    /// Port the engine listens on inside the container
    pub fn container_port(&self) -> u16 {
        match self {
            Engine::Postgres => 5432,
            Engine::Mysql | Engine::Mariadb => 3306,
            Engine::Mongodb => 27017,
            Engine::Redis => 6379,
        }
    }

    /// Environment passed to the container so the image bootstraps the credential
    pub fn credential_env(&self, credential: &Credential) -> Vec<(&'static str, String)> {
        match self {
            Engine::Postgres => vec![
                ("POSTGRES_USER", credential.username.clone()),
                ("POSTGRES_PASSWORD", credential.password.clone()),
                ("POSTGRES_DB", credential.database.clone()),
            ],
            Engine::Mysql => vec![
                ("MYSQL_USER", credential.username.clone()),
                ("MYSQL_PASSWORD", credential.password.clone()),
                ("MYSQL_DATABASE", credential.database.clone()),
                ("MYSQL_RANDOM_ROOT_PASSWORD", "yes".to_string()),
            ],
            Engine::Mariadb => vec![
                ("MARIADB_USER", credential.username.clone()),
                ("MARIADB_PASSWORD", credential.password.clone()),
                ("MARIADB_DATABASE", credential.database.clone()),
                ("MARIADB_RANDOM_ROOT_PASSWORD", "yes".to_string()),
            ],
            Engine::Mongodb => vec![
                ("MONGO_INITDB_ROOT_USERNAME", credential.username.clone()),
                ("MONGO_INITDB_ROOT_PASSWORD", credential.password.clone()),
                ("MONGO_INITDB_DATABASE", credential.database.clone()),
            ],
            Engine::Redis => vec![],
        }
    }

    /// Arguments appended after the image (Redis takes its password on the command line)
    pub fn command_args(&self, credential: &Credential) -> Vec<String> {
        match self {
            Engine::Redis => vec![
                "redis-server".to_string(),
                "--requirepass".to_string(),
                credential.password.clone(),
            ],
            _ => vec![],
        }
    }

    /// Whether the engine lets us pick the login name
    pub fn supports_custom_username(&self) -> bool {
        !matches!(self, Engine::Redis)
    }

    fn uri_scheme(&self) -> &'static str {
        match self {
            Engine::Postgres => "postgresql",
            Engine::Mysql | Engine::Mariadb => "mysql",
            Engine::Mongodb => "mongodb",
            Engine::Redis => "redis",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Engine::Postgres),
            "mysql" => Ok(Engine::Mysql),
            "mariadb" => Ok(Engine::Mariadb),
            "mongodb" | "mongo" => Ok(Engine::Mongodb),
            "redis" => Ok(Engine::Redis),
            other => Err(format!("unsupported engine: {}", other)),
        }
    }
}

// ============================================================================
// Instances
// ============================================================================

/// Lifecycle status of a managed instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Creating,
    Running,
    Suspended,
    Deleted,
}

impl InstanceStatus {
    /// Whether the instance still owns its host port
    pub fn holds_port(&self) -> bool {
        !matches!(self, InstanceStatus::Deleted)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Creating => "CREATING",
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Suspended => "SUSPENDED",
            InstanceStatus::Deleted => "DELETED",
        };
        f.write_str(s)
    }
}

/// Validated intent to create an instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningRequest {
    /// Idempotency key; a retried request carries the same id
    #[serde(default = "Uuid::new_v4")]
    pub instance_id: Uuid,

    pub user_id: String,

    pub subscription_id: String,

    /// Engine identifier such as `postgres` or `redis`
    pub engine: String,

    #[serde(default)]
    pub custom_name: Option<String>,
}

/// Persisted state of one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: Uuid,
    pub user_id: String,
    pub subscription_id: String,
    pub engine: Engine,
    pub display_name: String,
    pub container_name: String,
    pub host: String,
    pub port: u16,
    pub status: InstanceStatus,
    pub db_username: String,
    pub db_name: String,
    /// Argon2 PHC string of the generated password
    pub credential_hash: String,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceRecord {
    /// Copy of the record moved to `status`, timestamp refreshed
    pub fn with_status(&self, status: InstanceStatus) -> Self {
        Self {
            status,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }
}

/// Public view of an instance; never carries a password
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDetails {
    pub id: Uuid,
    pub user_id: String,
    pub subscription_id: String,
    pub engine: Engine,
    pub display_name: String,
    pub container_name: String,
    pub host: String,
    pub port: u16,
    pub status: InstanceStatus,
    pub db_username: String,
    pub db_name: String,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&InstanceRecord> for InstanceDetails {
    fn from(record: &InstanceRecord) -> Self {
        Self {
            id: record.id,
            user_id: record.user_id.clone(),
            subscription_id: record.subscription_id.clone(),
            engine: record.engine,
            display_name: record.display_name.clone(),
            container_name: record.container_name.clone(),
            host: record.host.clone(),
            port: record.port,
            status: record.status,
            db_username: record.db_username.clone(),
            db_name: record.db_name.clone(),
            last_error: record.last_error.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

// ============================================================================
// Credentials
// ============================================================================

/// Database login generated at creation time
///
/// The plaintext password only ever lives in this value, which is handed to
/// the caller of `create` and not kept anywhere else.
#[derive(Clone, Serialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
    pub database: String,
    pub host: String,
    pub port: u16,
}

impl Credential {
    /// Client connection string for the engine
    pub fn connection_uri(&self, engine: Engine) -> String {
        let base = format!(
            "{}://{}:{}@{}:{}/{}",
            engine.uri_scheme(),
            self.username,
            self.password,
            self.host,
            self.port,
            self.database
        );
        match engine {
            Engine::Mongodb => format!("{}?authSource=admin", base),
            _ => base,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

/// Result of a successful creation; the only place a password is disclosed
#[derive(Debug, Serialize)]
pub struct CreatedInstance {
    pub instance: InstanceDetails,
    pub credential: Credential,
    pub connection_uri: String,
}

/// Outcome of a create call
#[derive(Debug)]
pub enum CreateOutcome {
    /// A new container was provisioned
    Created(CreatedInstance),
    /// The id was already provisioned by an earlier request
    AlreadyProvisioned(InstanceDetails),
}

impl CreateOutcome {
    pub fn details(&self) -> &InstanceDetails {
        match self {
            CreateOutcome::Created(created) => &created.instance,
            CreateOutcome::AlreadyProvisioned(details) => details,
        }
    }
}

// ============================================================================
// Remote command output
// ============================================================================

/// Raw stdout/stderr/exit-code triple of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// ============================================================================
// Stats and logs
// ============================================================================

/// Point-in-time resource usage of an instance container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub instance_id: Uuid,
    pub container_name: String,
    pub cpu_percent: f64,
    pub memory_used_mb: f64,
    pub memory_limit_mb: f64,
    pub memory_percent: f64,
    pub net_rx_mb: f64,
    pub net_tx_mb: f64,
    pub block_read_mb: f64,
    pub block_write_mb: f64,
    pub pids: u32,
    pub collected_at: DateTime<Utc>,
}

/// Log severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Debug,
    Info,
    Warn,
    Error,
}

/// Output stream a log line was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One container log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub severity: LogSeverity,
    pub stream: LogStream,
    pub message: String,
}

// ============================================================================
// Events
// ============================================================================

/// Kind of lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceEventKind {
    Created,
    CreateFailed,
    Suspended,
    Resumed,
    Deleted,
    TransitionFailed,
}

/// Event emitted to the notification collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceEvent {
    pub kind: InstanceEventKind,
    pub instance_id: Uuid,
    pub user_id: String,
    pub status: InstanceStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub at: DateTime<Utc>,
}

impl InstanceEvent {
    pub fn new(kind: InstanceEventKind, record: &InstanceRecord) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("engine".to_string(), record.engine.to_string());
        metadata.insert("host".to_string(), record.host.clone());
        Self {
            kind,
            instance_id: record.id,
            user_id: record.user_id.clone(),
            status: record.status,
            message: None,
            metadata,
            at: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
