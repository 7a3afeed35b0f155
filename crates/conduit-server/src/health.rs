//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"degraded"` while the cascade monitor is shedding load.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Open WebSocket connections.
    pub connections: usize,
    /// Live user sessions.
    pub active_sessions: usize,
    /// Runs still executing.
    pub active_runs: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    connections: usize,
    sessions: usize,
    runs: usize,
    degraded: bool,
) -> HealthResponse {
    HealthResponse {
        status: if degraded { "degraded" } else { "ok" },
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        active_sessions: sessions,
        active_runs: runs,
    }
}
