//! Degraded responses and correlated-failure detection.
//!
//! [`FallbackCoordinator`] is stateless and only builds payloads.
//! [`CascadeMonitor`] keeps a sliding window of stage failures tagged by run
//! id; it never sees user data.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use conduit_core::ids::RunId;
use conduit_core::stage::StageKind;
use conduit_settings::CascadeSettings;
use conduit_telemetry::metrics::CASCADE_DEGRADED;
use metrics::gauge;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::warn;

use crate::errors::RuntimeError;

/// Builds safe payloads for failed stages and runs.
#[derive(Clone, Copy, Debug, Default)]
pub struct FallbackCoordinator;

impl FallbackCoordinator {
    /// Templated, non-empty response for a stage that could not produce one.
    pub fn emergency_response(stage_kind: StageKind, reason: &str) -> Value {
        let message = match stage_kind {
            StageKind::Triage => "We could not classify this request. It will be handled with default routing.",
            StageKind::Data => "Some data could not be retrieved. Results may be incomplete.",
            StageKind::Optimization => "Recommendations are unavailable right now. No changes were proposed.",
            StageKind::Reporting => "The report could not be generated. Please retry shortly.",
            StageKind::Action => "No action was taken. Nothing was changed on your behalf.",
        };
        json!({
            "kind": "emergency",
            "stage_kind": stage_kind.as_str(),
            "message": message,
            "reason": reason,
            "retryable": true,
        })
    }

    /// Response used while failures are correlated across many runs.
    pub fn cascade_prevention_response(affected_runs: usize, reason: &str) -> Value {
        json!({
            "kind": "cascade_prevention",
            "message": "The service is temporarily degraded. Your request was not processed.",
            "affected_runs": affected_runs,
            "reason": reason,
            "retryable": true,
        })
    }
}

/// Window and thresholds of the cascade monitor.
#[derive(Clone, Debug)]
pub struct CascadeConfig {
    /// Sliding window length.
    pub window: Duration,
    /// Failures inside the window needed to trip.
    pub failure_threshold: usize,
    /// Distinct runs those failures must span.
    pub min_distinct_runs: usize,
}

impl CascadeConfig {
    /// From the `cascade` settings section.
    pub fn from_settings(settings: &CascadeSettings) -> Self {
        Self {
            window: Duration::from_millis(settings.window_ms),
            failure_threshold: settings.failure_threshold,
            min_distinct_runs: settings.min_distinct_runs,
        }
    }
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self::from_settings(&CascadeSettings::default())
    }
}

/// Sliding-window detector of failures correlated across runs.
pub struct CascadeMonitor {
    config: CascadeConfig,
    failures: Mutex<VecDeque<(Instant, RunId)>>,
}

impl CascadeMonitor {
    /// Empty monitor.
    pub fn new(config: CascadeConfig) -> Self {
        Self {
            config,
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Record one stage failure of `run_id`.
    pub fn record_failure(&self, run_id: &RunId) {
        let now = Instant::now();
        let (failures, runs) = {
            let mut window = self.failures.lock();
            window.push_back((now, run_id.clone()));
            self.evict(&mut window, now);
            counts(&window)
        };
        let degraded = self.trips(failures, runs);
        gauge!(CASCADE_DEGRADED).set(if degraded { 1.0 } else { 0.0 });
        if degraded {
            warn!(failures, runs, "cascade threshold crossed");
        }
    }

    /// `CascadeThresholdExceeded` while degraded.
    pub fn check(&self) -> Result<(), RuntimeError> {
        let (failures, runs) = self.counts();
        if self.trips(failures, runs) {
            return Err(RuntimeError::CascadeThresholdExceeded { failures, runs });
        }
        Ok(())
    }

    /// Whether failures are currently correlated.
    pub fn is_degraded(&self) -> bool {
        self.check().is_err()
    }

    /// Failures and distinct runs inside the window.
    pub fn counts(&self) -> (usize, usize) {
        let mut window = self.failures.lock();
        self.evict(&mut window, Instant::now());
        counts(&window)
    }

    fn trips(&self, failures: usize, runs: usize) -> bool {
        failures >= self.config.failure_threshold && runs >= self.config.min_distinct_runs
    }

    fn evict(&self, window: &mut VecDeque<(Instant, RunId)>, now: Instant) {
        while window
            .front()
            .is_some_and(|(at, _)| now.saturating_duration_since(*at) > self.config.window)
        {
            let _ = window.pop_front();
        }
    }
}

fn counts(window: &VecDeque<(Instant, RunId)>) -> (usize, usize) {
    let runs: HashSet<&RunId> = window.iter().map(|(_, run)| run).collect();
    (window.len(), runs.len())
}
