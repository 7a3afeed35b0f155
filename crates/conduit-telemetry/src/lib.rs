//! # conduit-telemetry
//!
//! Logging and metrics setup shared by every Conduit binary.
//!
//! - [`init_telemetry`] installs a `tracing` subscriber with an `EnvFilter`
//!   and a JSON or human-readable `fmt` layer. `RUST_LOG` wins over the
//!   configured levels.
//! - [`metrics`] installs the Prometheus recorder and names every metric
//!   the runtime and server record.

#![deny(unsafe_code)]

pub mod metrics;

use conduit_settings::LoggingSettings;
use metrics_exporter_prometheus::PrometheusHandle;
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Telemetry setup failure.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A configured level name is not a tracing level.
    #[error("invalid log level `{0}`")]
    InvalidLevel(String),
    /// A global subscriber is already installed.
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
    /// A global metrics recorder is already installed.
    #[error("failed to install metrics recorder: {0}")]
    Recorder(String),
}

/// Subscriber and recorder options.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default level.
    pub log_level: Level,
    /// Per-module overrides, e.g. `("conduit_runtime", DEBUG)`.
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines instead of human-readable output.
    pub json: bool,
    /// Install the Prometheus recorder.
    pub metrics_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
            metrics_enabled: true,
        }
    }
}

impl TelemetryConfig {
    /// Build from the `logging` settings section.
    pub fn from_settings(settings: &LoggingSettings) -> Result<Self, TelemetryError> {
        let log_level = parse_level(&settings.level)?;
        let module_levels = settings
            .modules
            .iter()
            .map(|(module, level)| Ok((module.clone(), parse_level(level)?)))
            .collect::<Result<Vec<_>, TelemetryError>>()?;
        Ok(Self {
            log_level,
            module_levels,
            json: settings.json,
            metrics_enabled: settings.metrics_enabled,
        })
    }

    /// `EnvFilter` directive string, e.g. `info,conduit_runtime=debug`.
    pub fn filter_directives(&self) -> String {
        let mut directives = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            directives.push(',');
            directives.push_str(module);
            directives.push('=');
            directives.push_str(&level.to_string().to_lowercase());
        }
        directives
    }
}

fn parse_level(raw: &str) -> Result<Level, TelemetryError> {
    raw.parse::<Level>()
        .map_err(|_| TelemetryError::InvalidLevel(raw.to_string()))
}

/// Handle to what [`init_telemetry`] installed.
pub struct TelemetryGuard {
    directives: String,
    prometheus: Option<PrometheusHandle>,
}

impl TelemetryGuard {
    /// Filter directives in effect when `RUST_LOG` is unset.
    pub fn directives(&self) -> &str {
        &self.directives
    }

    /// Prometheus handle, when metrics are enabled.
    pub fn prometheus(&self) -> Option<&PrometheusHandle> {
        self.prometheus.as_ref()
    }
}

/// Install the global subscriber and, if enabled, the metrics recorder.
/// Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let directives = config.filter_directives();
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
    });
    let text_layer = (!config.json).then(|| tracing_subscriber::fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))?;

    let prometheus = if config.metrics_enabled {
        Some(metrics::install_recorder()?)
    } else {
        None
    };

    tracing::info!(filter = %directives, json = config.json, "telemetry initialized");
    Ok(TelemetryGuard {
        directives,
        prometheus,
    })
}
