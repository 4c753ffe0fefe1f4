//! Parsing of `docker stats --no-stream --format '{{json .}}'` output

use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::models::StatsSnapshot;

#[derive(Debug, Deserialize)]
struct DockerStatsLine {
    #[serde(rename = "CPUPerc", default)]
    cpu_perc: String,
    #[serde(rename = "MemUsage", default)]
    mem_usage: String,
    #[serde(rename = "MemPerc", default)]
    mem_perc: String,
    #[serde(rename = "NetIO", default)]
    net_io: String,
    #[serde(rename = "BlockIO", default)]
    block_io: String,
    #[serde(rename = "PIDs", default)]
    pids: String,
}

/// Build a snapshot from the first JSON line of docker stats output
pub fn parse_stats(
    instance_id: Uuid,
    container_name: &str,
    stdout: &str,
) -> Result<StatsSnapshot, String> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| "empty stats output".to_string())?;

    let raw: DockerStatsLine =
        serde_json::from_str(line).map_err(|e| format!("malformed stats output: {}", e))?;

    let (memory_used_mb, memory_limit_mb) = parse_pair(&raw.mem_usage);
    let (net_rx_mb, net_tx_mb) = parse_pair(&raw.net_io);
    let (block_read_mb, block_write_mb) = parse_pair(&raw.block_io);

    Ok(StatsSnapshot {
        instance_id,
        container_name: container_name.to_string(),
        cpu_percent: parse_percent(&raw.cpu_perc),
        memory_used_mb,
        memory_limit_mb,
        memory_percent: parse_percent(&raw.mem_perc),
        net_rx_mb,
        net_tx_mb,
        block_read_mb,
        block_write_mb,
        pids: raw.pids.trim().parse().unwrap_or(0),
        collected_at: Utc::now(),
    })
}

fn parse_percent(s: &str) -> f64 {
    s.trim().trim_end_matches('%').parse().unwrap_or(0.0)
}

/// `"5.3MiB / 1.9GiB"` into megabytes on both sides
fn parse_pair(s: &str) -> (f64, f64) {
    let mut parts = s.split('/');
    let left = parts.next().map(parse_size_mb).unwrap_or(0.0);
    let right = parts.next().map(parse_size_mb).unwrap_or(0.0);
    (left, right)
}

/// Convert a docker size string into MiB
///
/// Docker mixes binary units (memory) and decimal units (network and block
/// IO); both are folded into MiB here.
pub fn parse_size_mb(s: &str) -> f64 {
    const UNITS: &[(&str, f64)] = &[
        ("TiB", 1024.0 * 1024.0),
        ("GiB", 1024.0),
        ("MiB", 1.0),
        ("KiB", 1.0 / 1024.0),
        ("TB", 1_000_000_000_000.0 / 1_048_576.0),
        ("GB", 1_000_000_000.0 / 1_048_576.0),
        ("MB", 1_000_000.0 / 1_048_576.0),
        ("kB", 1_000.0 / 1_048_576.0),
        ("KB", 1_000.0 / 1_048_576.0),
        ("B", 1.0 / 1_048_576.0),
    ];

    let s = s.trim();
    for (suffix, factor) in UNITS {
        if let Some(num) = s.strip_suffix(suffix) {
            return num.trim().parse::<f64>().map(|n| n * factor).unwrap_or(0.0);
        }
    }
    0.0
}
