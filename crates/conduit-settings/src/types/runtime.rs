//! Orchestration, lifecycle, and cascade settings.

use serde::{Deserialize, Serialize};

/// Stage execution limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestrationSettings {
    /// Per-stage time budget.
    pub stage_timeout_ms: u64,
}

impl Default for OrchestrationSettings {
    fn default() -> Self {
        Self {
            stage_timeout_ms: 120_000,
        }
    }
}

/// Session reclamation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LifecycleSettings {
    /// Idle time before a session with no runs and no connection is reclaimed.
    pub idle_threshold_ms: u64,
    /// Idle threshold for sessions marked over their memory cap.
    pub priority_idle_threshold_ms: u64,
    /// Detached time after which a session's active runs are cancelled.
    pub orphan_timeout_ms: u64,
    /// Sweep period.
    pub sweep_interval_ms: u64,
    /// Per-user footprint above which the session is marked for priority reclamation.
    pub memory_cap_bytes: usize,
    /// Finished run records kept in the in-memory archive.
    pub archive_capacity: usize,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            idle_threshold_ms: 600_000,
            priority_idle_threshold_ms: 30_000,
            orphan_timeout_ms: 900_000,
            sweep_interval_ms: 30_000,
            memory_cap_bytes: 8 * 1024 * 1024,
            archive_capacity: 1000,
        }
    }
}

/// Correlated-failure detection window.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CascadeSettings {
    /// Sliding window length.
    pub window_ms: u64,
    /// Stage failures inside the window that trip the monitor.
    pub failure_threshold: usize,
    /// Distinct runs those failures must span.
    pub min_distinct_runs: usize,
}

impl Default for CascadeSettings {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            failure_threshold: 20,
            min_distinct_runs: 5,
        }
    }
}
