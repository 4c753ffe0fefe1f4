//! Prometheus metrics export
//!
//! Counters and gauges for the session pools, remote commands, lifecycle
//! transitions and stats collection. The exporter serves `/metrics` on its
//! own listener.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use tracing::info;

use crate::config::MetricsConfig;
use crate::models::StatsSnapshot;

/// Install the Prometheus recorder and HTTP listener
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid metrics listen address {}", config.listen_addr))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full("dbaas_remote_command_duration_seconds".to_string()),
            &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
        )
        .context("Invalid histogram buckets")?
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!(addr = %addr, "Metrics exporter listening");
    Ok(())
}

/// Outcome of a pool acquire: `reused`, `opened` or `exhausted`
pub fn record_pool_acquire(host: &str, outcome: &'static str) {
    counter!("dbaas_pool_acquire_total", "host" => host.to_string(), "outcome" => outcome).increment(1);
}

pub fn record_pool_occupancy(host: &str, idle: usize, borrowed: usize) {
    gauge!("dbaas_pool_idle_sessions", "host" => host.to_string()).set(idle as f64);
    gauge!("dbaas_pool_borrowed_sessions", "host" => host.to_string()).set(borrowed as f64);
}

pub fn record_session_opened(host: &str) {
    counter!("dbaas_sessions_opened_total", "host" => host.to_string()).increment(1);
}

pub fn record_session_closed(host: &str) {
    counter!("dbaas_sessions_closed_total", "host" => host.to_string()).increment(1);
}

pub fn record_connect_failure(host: &str) {
    counter!("dbaas_connect_failures_total", "host" => host.to_string()).increment(1);
}

/// Remote command outcome: `completed`, `timeout` or `transport_error`
pub fn record_command(host: &str, program: &str, outcome: &'static str, duration: Duration) {
    counter!(
        "dbaas_remote_commands_total",
        "host" => host.to_string(),
        "program" => program.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!("dbaas_remote_command_duration_seconds", "host" => host.to_string())
        .record(duration.as_secs_f64());
}

pub fn record_transition(event: &'static str, outcome: &'static str) {
    counter!("dbaas_transitions_total", "event" => event, "outcome" => outcome).increment(1);
}

pub fn record_stats_failure(host: &str) {
    counter!("dbaas_stats_failures_total", "host" => host.to_string()).increment(1);
}

/// Latest resource usage of one instance
pub fn record_instance_usage(snapshot: &StatsSnapshot) {
    let id = snapshot.instance_id.to_string();
    gauge!("dbaas_instance_cpu_percent", "instance" => id.clone()).set(snapshot.cpu_percent);
    gauge!("dbaas_instance_memory_mb", "instance" => id).set(snapshot.memory_used_mb);
}
