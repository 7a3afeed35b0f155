//! Prometheus recorder and metric names.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::TelemetryError;

/// Install the global Prometheus recorder and describe known metrics.
pub fn install_recorder() -> Result<PrometheusHandle, TelemetryError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| TelemetryError::Recorder(e.to_string()))?;
    describe();
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

fn describe() {
    ::metrics::describe_counter!(RUNS_STARTED_TOTAL, "Runs accepted by the engine factory");
    ::metrics::describe_counter!(RUNS_FINISHED_TOTAL, "Runs that reached a terminal state");
    ::metrics::describe_gauge!(RUNS_ACTIVE, "Runs currently executing");
    ::metrics::describe_histogram!(STAGE_DURATION_SECONDS, "Stage wall-clock duration");
    ::metrics::describe_counter!(STAGE_FAILURES_TOTAL, "Stages that ended failed");
    ::metrics::describe_counter!(EVENTS_EMITTED_TOTAL, "Envelopes emitted by the event bridge");
    ::metrics::describe_gauge!(SESSIONS_ACTIVE, "Live user sessions");
    ::metrics::describe_counter!(SESSIONS_RECLAIMED_TOTAL, "Sessions reclaimed by the lifecycle manager");
    ::metrics::describe_counter!(ORPHAN_RUNS_CANCELLED_TOTAL, "Detached runs cancelled by the sweeper");
    ::metrics::describe_gauge!(CASCADE_DEGRADED, "1 while correlated failures exceed the threshold");
    ::metrics::describe_counter!(WS_CONNECTIONS_TOTAL, "WebSocket connections opened");
    ::metrics::describe_gauge!(WS_CONNECTIONS_ACTIVE, "Open WebSocket connections");
    ::metrics::describe_counter!(WS_HEARTBEAT_EVICTIONS_TOTAL, "Connections closed for missed pongs");
    ::metrics::describe_counter!(WS_SEND_FAILURES_TOTAL, "Connections detached because their queue was full or closed");
    ::metrics::describe_counter!(WS_REPLAYED_TOTAL, "Envelopes replayed on attach");
}

/// Runs started (counter).
pub const RUNS_STARTED_TOTAL: &str = "conduit_runs_started_total";
/// Runs finished (counter, labels: status).
pub const RUNS_FINISHED_TOTAL: &str = "conduit_runs_finished_total";
/// Runs executing (gauge).
pub const RUNS_ACTIVE: &str = "conduit_runs_active";
/// Stage duration (histogram, labels: stage_kind, status).
pub const STAGE_DURATION_SECONDS: &str = "conduit_stage_duration_seconds";
/// Stage failures (counter, labels: stage_kind, code).
pub const STAGE_FAILURES_TOTAL: &str = "conduit_stage_failures_total";
/// Envelopes emitted (counter, labels: type).
pub const EVENTS_EMITTED_TOTAL: &str = "conduit_events_emitted_total";
/// Live sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "conduit_sessions_active";
/// Reclaimed sessions (counter).
pub const SESSIONS_RECLAIMED_TOTAL: &str = "conduit_sessions_reclaimed_total";
/// Orphaned runs cancelled (counter).
pub const ORPHAN_RUNS_CANCELLED_TOTAL: &str = "conduit_orphan_runs_cancelled_total";
/// Cascade monitor state (gauge). 1 = degraded.
pub const CASCADE_DEGRADED: &str = "conduit_cascade_degraded";
/// WebSocket connections opened (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "conduit_ws_connections_total";
/// Open WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "conduit_ws_connections_active";
/// Heartbeat evictions (counter).
pub const WS_HEARTBEAT_EVICTIONS_TOTAL: &str = "conduit_ws_heartbeat_evictions_total";
/// Send failures (counter).
pub const WS_SEND_FAILURES_TOTAL: &str = "conduit_ws_send_failures_total";
/// Replayed envelopes (counter).
pub const WS_REPLAYED_TOTAL: &str = "conduit_ws_replayed_total";
