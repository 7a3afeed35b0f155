//! Server, heartbeat, and logging settings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Listener and transport limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port. `0` picks a free port.
    pub port: u16,
    /// Outbound queue depth per connection.
    pub send_queue_capacity: usize,
    /// Largest inbound WebSocket message accepted.
    pub max_message_bytes: usize,
    /// Grace period for in-flight tasks on shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9400,
            send_queue_capacity: 1024,
            max_message_bytes: 1024 * 1024,
            shutdown_timeout_ms: 30_000,
        }
    }
}

/// Ping/pong keepalive.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    /// Time between pings.
    pub interval_ms: u64,
    /// Consecutive unanswered pings tolerated before eviction.
    pub max_missed_beats: u32,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: 15_000,
            max_missed_beats: 2,
        }
    }
}

/// Log output.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level (`trace`..`error`). `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Per-module level overrides, e.g. `{"conduit_runtime": "debug"}`.
    pub modules: BTreeMap<String, String>,
    /// Install the Prometheus recorder.
    pub metrics_enabled: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            modules: BTreeMap::new(),
            metrics_enabled: true,
        }
    }
}
