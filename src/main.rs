//! dbaas-provisioner - operator binary for the provisioning engine
//!
//! `serve` runs the periodic stats collector against the configured hosts;
//! the other subcommands perform one lifecycle operation and exit.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};
use uuid::Uuid;

use dbaas_provisioner::config::AppConfig;
use dbaas_provisioner::logging::{init_cli_logging, init_logging};
use dbaas_provisioner::models::{
    CreateOutcome, InstanceDetails, InstanceStatus, LogSeverity, ProvisioningRequest,
};
use dbaas_provisioner::persistence::JsonFileStore;
use dbaas_provisioner::remote::SshConnector;
use dbaas_provisioner::{notify, HostHealth, ProvisioningEngine};

/// Provision and manage database containers on remote hosts
#[derive(Parser)]
#[command(name = "dbaas-provisioner")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Remote database instance provisioning engine", long_about = None)]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the stats collector until interrupted
    Serve,

    /// Check connectivity to every configured host
    CheckHosts,

    /// Create a new database instance
    Create {
        /// Engine (postgres, mysql, mariadb, mongodb, redis)
        #[arg(short, long)]
        engine: String,

        /// Owning user
        #[arg(short, long)]
        user: String,

        /// Subscription the instance is billed to
        #[arg(short, long)]
        subscription: String,

        /// Display name
        #[arg(short, long)]
        name: Option<String>,

        /// Instance id; reuse it to retry a create safely
        #[arg(long)]
        id: Option<Uuid>,
    },

    /// Stop a running instance
    Suspend { id: Uuid },

    /// Start a suspended instance
    Resume { id: Uuid },

    /// Remove an instance and its container
    Delete { id: Uuid },

    /// Show one instance, or list all of them
    Show { id: Option<Uuid> },

    /// Read current resource usage
    Stats {
        id: Uuid,

        /// Print stored history instead of sampling
        #[arg(long)]
        history: bool,
    },

    /// Read container logs
    Logs {
        id: Uuid,

        /// Only lines after this RFC 3339 timestamp
        #[arg(long)]
        since: Option<DateTime<Utc>>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load()?;

    if matches!(cli.command, Commands::Serve) {
        init_logging(&config.log_level)?;
    } else {
        init_cli_logging(&config.log_level)?;
    }

    let repository = Arc::new(
        JsonFileStore::open(&config.storage.data_dir)
            .await
            .context("Failed to open instance store")?,
    );
    let notifier = notify::from_config(&config.notifications);
    let engine = ProvisioningEngine::build(
        config,
        Arc::new(SshConnector::new()),
        repository,
        notifier,
    )?;

    let result = run(&engine, cli.command, cli.output).await;
    engine.shutdown().await;
    result
}

async fn run(engine: &ProvisioningEngine, command: Commands, output: OutputFormat) -> Result<()> {
    match command {
        Commands::Serve => serve(engine).await,

        Commands::CheckHosts => {
            let health = engine.check_hosts().await;
            if output == OutputFormat::Json {
                return print_json(&health);
            }
            print_health(&health);
            if health.iter().any(|h| !h.reachable) {
                anyhow::bail!("One or more hosts are unreachable");
            }
            Ok(())
        }

        Commands::Create {
            engine: engine_name,
            user,
            subscription,
            name,
            id,
        } => {
            let request = ProvisioningRequest {
                instance_id: id.unwrap_or_else(Uuid::new_v4),
                user_id: user,
                subscription_id: subscription,
                engine: engine_name,
                custom_name: name,
            };
            match engine.lifecycle.create(request).await? {
                CreateOutcome::Created(created) => {
                    if output == OutputFormat::Json {
                        return print_json(&created);
                    }
                    print_instance(&created.instance);
                    println!("{}", "Credentials (shown once, store them now):".bright_yellow().bold());
                    println!("  {} {}", "Username:".cyan(), created.credential.username);
                    println!("  {} {}", "Password:".cyan(), created.credential.password);
                    println!("  {} {}", "Database:".cyan(), created.credential.database);
                    println!("  {} {}", "URI:".cyan(), created.connection_uri);
                }
                CreateOutcome::AlreadyProvisioned(details) => {
                    if output == OutputFormat::Json {
                        return print_json(&details);
                    }
                    println!("{}", "Instance already provisioned; credentials are not shown again".yellow());
                    print_instance(&details);
                }
            }
            Ok(())
        }

        Commands::Suspend { id } => report(engine.lifecycle.suspend(id).await?, output),
        Commands::Resume { id } => report(engine.lifecycle.resume(id).await?, output),
        Commands::Delete { id } => report(engine.lifecycle.delete(id).await?, output),

        Commands::Show { id: Some(id) } => report(engine.lifecycle.get(id).await?, output),
        Commands::Show { id: None } => {
            let instances = engine.lifecycle.list().await?;
            if output == OutputFormat::Json {
                return print_json(&instances);
            }
            println!("{}", "Instances".bright_cyan().bold());
            println!("{}", "=".repeat(60).bright_blue());
            for instance in &instances {
                println!(
                    "  {} {:<10} {:<9} {}:{}  {}",
                    instance.id,
                    instance.engine.to_string(),
                    colored_status(instance.status),
                    instance.host,
                    instance.port,
                    instance.display_name
                );
            }
            Ok(())
        }

        Commands::Stats { id, history: true } => {
            let history = engine.repository.recent_stats(id, 100).await?;
            print_json(&history)
        }
        Commands::Stats { id, history: false } => {
            let snapshot = engine.collector.collect(id).await?;
            if output == OutputFormat::Json {
                return print_json(&snapshot);
            }
            println!("{} {}", "Container:".cyan(), snapshot.container_name);
            println!("{} {:.2}%", "CPU:".cyan(), snapshot.cpu_percent);
            println!(
                "{} {:.1} / {:.1} MiB ({:.2}%)",
                "Memory:".cyan(),
                snapshot.memory_used_mb,
                snapshot.memory_limit_mb,
                snapshot.memory_percent
            );
            println!("{} {:.2} / {:.2} MiB", "Net rx/tx:".cyan(), snapshot.net_rx_mb, snapshot.net_tx_mb);
            println!(
                "{} {:.2} / {:.2} MiB",
                "Block r/w:".cyan(),
                snapshot.block_read_mb,
                snapshot.block_write_mb
            );
            println!("{} {}", "PIDs:".cyan(), snapshot.pids);
            Ok(())
        }

        Commands::Logs { id, since } => {
            let entries = engine.collector.collect_logs(id, since).await?;
            if output == OutputFormat::Json {
                return print_json(&entries);
            }
            for entry in entries {
                let severity = match entry.severity {
                    LogSeverity::Error => "ERROR".red(),
                    LogSeverity::Warn => "WARN ".yellow(),
                    LogSeverity::Info => "INFO ".normal(),
                    LogSeverity::Debug => "DEBUG".dimmed(),
                };
                println!("{} {} {}", entry.timestamp.to_rfc3339().dimmed(), severity, entry.message);
            }
            Ok(())
        }
    }
}

async fn serve(engine: &ProvisioningEngine) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "Starting dbaas-provisioner");

    dbaas_provisioner::metrics::init_metrics(&engine.config.metrics)?;

    for health in engine.check_hosts().await {
        if health.reachable {
            info!(host = %health.host, "Host reachable");
        } else {
            warn!(host = %health.host, "Host unreachable at startup");
        }
    }

    let collector = engine
        .config
        .collector
        .enabled
        .then(|| engine.collector.clone().spawn_periodic(engine.collector_interval()));

    shutdown_signal().await;
    info!("Shutdown signal received");

    if let Some(task) = collector {
        task.abort();
    }
    Ok(())
}

fn report(details: InstanceDetails, output: OutputFormat) -> Result<()> {
    if output == OutputFormat::Json {
        return print_json(&details);
    }
    print_instance(&details);
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn colored_status(status: InstanceStatus) -> colored::ColoredString {
    let label = status.to_string();
    match status {
        InstanceStatus::Running => label.green(),
        InstanceStatus::Creating => label.yellow(),
        InstanceStatus::Suspended => label.blue(),
        InstanceStatus::Deleted => label.red(),
    }
}

fn print_instance(instance: &InstanceDetails) {
    println!("{}", "=".repeat(60).bright_blue());
    println!("{} {}", "Instance:".bright_cyan(), instance.id);
    println!("{} {}", "Name:".bright_cyan(), instance.display_name);
    println!("{} {}", "Engine:".bright_cyan(), instance.engine);
    println!("{} {}", "Status:".bright_cyan(), colored_status(instance.status));
    println!("{} {}:{}", "Endpoint:".bright_cyan(), instance.host, instance.port);
    println!("{} {}", "Container:".bright_cyan(), instance.container_name);
    if let Some(ref error) = instance.last_error {
        println!("{} {}", "Last error:".bright_red(), error);
    }
    println!("{}", "=".repeat(60).bright_blue());
}

fn print_health(health: &[HostHealth]) {
    println!("{}", "Remote hosts".bright_cyan().bold());
    println!("{}", "=".repeat(40).bright_blue());
    for host in health {
        let state = if host.reachable {
            "reachable".green()
        } else {
            "unreachable".red()
        };
        println!(
            "  {:<16} {}  (idle {}, borrowed {}, max {})",
            host.host, state, host.pool.idle, host.pool.borrowed, host.pool.max_size
        );
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
