//! Container resource statistics
//!
//! Parses the engine's one-shot stats document
//! (`GET /containers/<id>/stats?stream=false`).

use serde::{Deserialize, Serialize};

/// Point-in-time resource usage of one container
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    /// Percent of one core (200.0 = two cores fully busy)
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_limit_bytes: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CpuUsage {
    #[serde(default)]
    total_usage: u64,
    #[serde(default)]
    percpu_usage: Option<Vec<u64>>,
}

#[derive(Debug, Default, Deserialize)]
struct CpuStats {
    #[serde(default)]
    cpu_usage: CpuUsage,
    #[serde(default)]
    system_cpu_usage: Option<u64>,
    #[serde(default)]
    online_cpus: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct MemoryStats {
    #[serde(default)]
    usage: Option<u64>,
    #[serde(default)]
    limit: Option<u64>,
    #[serde(default)]
    stats: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Default, Deserialize)]
struct StatsDocument {
    #[serde(default)]
    cpu_stats: CpuStats,
    #[serde(default)]
    precpu_stats: CpuStats,
    #[serde(default)]
    memory_stats: MemoryStats,
}

/// CPU percent from two cumulative counter snapshots
///
/// **Algorithm:**
/// 1. `cpu_delta` = container usage now minus usage at the previous sample
/// 2. `system_delta` = host usage now minus host usage at the previous sample
/// 3. percent = `cpu_delta / system_delta * cores * 100`
///
/// Returns 0.0 when either delta is not positive (first sample, counter reset).
pub fn compute_cpu_percent(
    container_now: u64,
    container_prev: u64,
    system_now: u64,
    system_prev: u64,
    cores: u32,
) -> f64 {
    let cpu_delta = container_now.saturating_sub(container_prev) as f64;
    let system_delta = system_now.saturating_sub(system_prev) as f64;
    if cpu_delta <= 0.0 || system_delta <= 0.0 {
        return 0.0;
    }
    cpu_delta / system_delta * cores.max(1) as f64 * 100.0
}

/// Parse an engine stats document
pub fn parse_stats(body: &[u8]) -> Result<ContainerStats, serde_json::Error> {
    let doc: StatsDocument = serde_json::from_slice(body)?;

    let cores = doc.cpu_stats.online_cpus.unwrap_or_else(|| {
        doc.cpu_stats
            .cpu_usage
            .percpu_usage
            .as_ref()
            .map(|v| v.len() as u32)
            .unwrap_or(1)
    });

    let cpu_percent = compute_cpu_percent(
        doc.cpu_stats.cpu_usage.total_usage,
        doc.precpu_stats.cpu_usage.total_usage,
        doc.cpu_stats.system_cpu_usage.unwrap_or(0),
        doc.precpu_stats.system_cpu_usage.unwrap_or(0),
        cores,
    );

    // Page cache is reclaimable; report working set like `docker stats`
    let cache = doc
        .memory_stats
        .stats
        .as_ref()
        .and_then(|s| s.get("inactive_file").or_else(|| s.get("cache")))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let memory_bytes = doc.memory_stats.usage.unwrap_or(0).saturating_sub(cache);

    Ok(ContainerStats {
        cpu_percent,
        memory_bytes,
        memory_limit_bytes: doc.memory_stats.limit,
    })
}
