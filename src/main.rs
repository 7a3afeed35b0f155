//! Conduit server binary.
//!
//! Loads settings, installs telemetry, wires the reference pipeline into a
//! runtime, and serves it over WebSocket until interrupted.

#![deny(unsafe_code)]

mod pipeline;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use conduit_runtime::{Runtime, RuntimeConfig, RuntimeDeps};
use conduit_server::{ConduitServer, ServerConfig};
use conduit_settings::{ConduitSettings, load_settings, load_settings_from_path};
use conduit_telemetry::{TelemetryConfig, init_telemetry};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "conduit", about = "Per-user multi-agent execution server")]
struct Cli {
    /// Settings file (default: ~/.conduit/settings.json).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Override the bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,
}

impl Cli {
    fn server_config(&self, settings: &ConduitSettings) -> ServerConfig {
        let mut config = ServerConfig::from_settings(settings);
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => load_settings_from_path(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => load_settings().context("failed to load settings")?,
    };

    let telemetry = TelemetryConfig::from_settings(&settings.logging)
        .context("invalid logging settings")?;
    let guard = init_telemetry(&telemetry).context("failed to initialize telemetry")?;

    let (runtime, events) = Runtime::new(RuntimeDeps {
        config: RuntimeConfig::from_settings(&settings),
        agents: Arc::new(pipeline::agents()),
        tools: Arc::new(pipeline::tools()),
        archive: None,
    });

    let server = ConduitServer::new(
        cli.server_config(&settings),
        runtime,
        guard.prometheus().cloned(),
    );
    let handle = server.listen(events).await.context("failed to start server")?;
    info!(
        addr = %handle.addr(),
        stages = ?pipeline::STAGES,
        "conduit ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    server.stop(handle).await;
    Ok(())
}
