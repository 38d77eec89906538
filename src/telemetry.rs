//! # Telemetry — Worker Host Profiling
//!
//! Collects host facts from each worker via [`sysinfo`]. The static
//! profile (cores, memory, hostname) becomes the worker's capability
//! document at registration; the live metrics ride along on heartbeats
//! for fleet dashboards. The `sysinfo::System` instance is reused across
//! heartbeats to amortize initialization cost.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sysinfo::System;

/// Live host metrics attached to heartbeats.
#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct HostMetrics {
    pub cpu_usage_percent: f32,
    pub memory_used_gb: f64,
    pub memory_total_gb: f64,
    pub load_avg_1m: f64,
}

pub fn collect(sys: &System) -> HostMetrics {
    let mem_total = sys.total_memory() as f64 / 1_073_741_824.0;
    let mem_used = sys.used_memory() as f64 / 1_073_741_824.0;
    let load = System::load_average();
    HostMetrics {
        cpu_usage_percent: (sys.global_cpu_usage() * 10.0).round() / 10.0,
        memory_used_gb: (mem_used * 10.0).round() / 10.0,
        memory_total_gb: (mem_total * 10.0).round() / 10.0,
        load_avg_1m: (load.one * 100.0).round() / 100.0,
    }
}

/// Capability document advertised at registration. Opaque to the registry
/// except for documented selection keys (`gpu`, `cores`, `memory_gb`).
pub fn capabilities(sys: &System, gpu: bool) -> Value {
    let mem_total_gb = (sys.total_memory() as f64 / 1_073_741_824.0).round();
    serde_json::json!({
        "hostname": System::host_name().unwrap_or_else(|| "unknown".to_string()),
        "cores": sys.cpus().len(),
        "memory_gb": mem_total_gb,
        "gpu": gpu,
    })
}
