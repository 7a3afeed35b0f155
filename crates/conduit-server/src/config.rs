//! Server configuration.

use std::time::Duration;

use conduit_settings::ConduitSettings;

/// Listener, queue, and heartbeat tuning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` picks a free port).
    pub port: u16,
    /// Outbound frames queued per connection before it counts as stalled.
    pub send_queue_capacity: usize,
    /// Largest inbound WebSocket message accepted.
    pub max_message_bytes: usize,
    /// Time between pings.
    pub heartbeat_interval: Duration,
    /// Unanswered pings tolerated before eviction.
    pub max_missed_beats: u32,
    /// How long shutdown waits for background tasks.
    pub shutdown_timeout: Duration,
}

impl ServerConfig {
    /// From loaded settings.
    pub fn from_settings(settings: &ConduitSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            send_queue_capacity: settings.server.send_queue_capacity,
            max_message_bytes: settings.server.max_message_bytes,
            heartbeat_interval: Duration::from_millis(settings.heartbeat.interval_ms),
            max_missed_beats: settings.heartbeat.max_missed_beats,
            shutdown_timeout: Duration::from_millis(settings.server.shutdown_timeout_ms),
        }
    }

    /// `host:port` for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    /// Compiled defaults with an auto-assigned port.
    fn default() -> Self {
        Self {
            port: 0,
            ..Self::from_settings(&ConduitSettings::default())
        }
    }
}
