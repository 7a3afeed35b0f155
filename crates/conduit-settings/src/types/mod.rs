//! Settings type definitions.
//!
//! Field names are camelCase on the wire. Every section is
//! `#[serde(default)]`, so a settings file only has to name what it changes.

mod runtime;
mod server;

pub use runtime::*;
pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9400 },
///   "heartbeat": { "intervalMs": 10000, "maxMissedBeats": 3 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConduitSettings {
    /// Network listener and transport limits.
    pub server: ServerSettings,
    /// Connection keepalive.
    pub heartbeat: HeartbeatSettings,
    /// Stage execution.
    pub orchestration: OrchestrationSettings,
    /// Session reclamation and footprint limits.
    pub lifecycle: LifecycleSettings,
    /// Correlated-failure detection.
    pub cascade: CascadeSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl ConduitSettings {
    /// Reject combinations that would make the runtime misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat.interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "heartbeat.intervalMs must be positive".into(),
            ));
        }
        if self.server.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sendQueueCapacity must be positive".into(),
            ));
        }
        if self.orchestration.stage_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "orchestration.stageTimeoutMs must be positive".into(),
            ));
        }
        if self.lifecycle.priority_idle_threshold_ms > self.lifecycle.idle_threshold_ms {
            return Err(SettingsError::InvalidValue(
                "lifecycle.priorityIdleThresholdMs must not exceed idleThresholdMs".into(),
            ));
        }
        if self.cascade.failure_threshold == 0 || self.cascade.min_distinct_runs == 0 {
            return Err(SettingsError::InvalidValue(
                "cascade thresholds must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
