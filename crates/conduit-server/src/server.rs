//! `ConduitServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use conduit_runtime::bridge::BridgedEnvelope;
use conduit_runtime::session::{DetachReason, SessionSummary};
use conduit_runtime::Runtime;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::shutdown::{ServiceTask, ShutdownCoordinator};
use crate::websocket::manager::{ConnectionManager, ConnectionStats};
use crate::websocket::session::{run_ws_session, HeartbeatPolicy};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection manager (and through it, the runtime).
    pub manager: Arc<ConnectionManager>,
    /// Prometheus handle, when metrics are enabled.
    pub metrics: Option<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
    /// Heartbeat applied to every connection.
    pub heartbeat: HeartbeatPolicy,
    /// Largest inbound message accepted.
    pub max_message_bytes: usize,
}

/// `/sessions` response body.
#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    /// One summary per live session, ordered by user.
    pub sessions: Vec<SessionSummary>,
    /// Connection counts by state.
    pub connections: ConnectionStats,
}

/// Background tasks of a listening server.
pub struct ServerHandle {
    addr: SocketAddr,
    tasks: Vec<ServiceTask>,
}

impl ServerHandle {
    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// The Conduit server.
pub struct ConduitServer {
    config: ServerConfig,
    manager: Arc<ConnectionManager>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl ConduitServer {
    /// Server in front of `runtime`.
    pub fn new(config: ServerConfig, runtime: Runtime, metrics: Option<PrometheusHandle>) -> Self {
        let manager = Arc::new(ConnectionManager::new(runtime, config.send_queue_capacity));
        Self {
            config,
            manager,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics,
            start_time: Instant::now(),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            manager: Arc::clone(&self.manager),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
            heartbeat: HeartbeatPolicy {
                interval: self.config.heartbeat_interval,
                max_missed_beats: self.config.max_missed_beats,
            },
            max_message_bytes: self.config.max_message_bytes,
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/sessions", get(sessions_handler))
            .route("/ws", get(ws_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the listener and start serving, dispatching `events` from the
    /// runtime and sweeping idle sessions in the background.
    pub async fn listen(
        &self,
        events: mpsc::UnboundedReceiver<BridgedEnvelope>,
    ) -> Result<ServerHandle, ServerError> {
        let addr = self.config.bind_addr();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let token = self.shutdown.token();
        let router = self.router();
        let serve_token = token.clone();
        let server = tokio::spawn(async move {
            let shutdown = async move { serve_token.cancelled().await };
            if let Err(err) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(%err, "server stopped with error");
            }
        });
        let dispatch = self.manager.spawn_dispatch(events, token.clone());
        let sweeper = Arc::clone(self.manager.runtime().lifecycle()).spawn_sweeper(token);

        info!(addr = %local_addr, "conduit server listening");
        Ok(ServerHandle {
            addr: local_addr,
            tasks: vec![
                ServiceTask::new("listener", server),
                ServiceTask::new("dispatch", dispatch),
                ServiceTask::new("sweeper", sweeper),
            ],
        })
    }

    /// Stop accepting, close every connection, and wait for background
    /// tasks. Runs are not cancelled.
    pub async fn stop(&self, handle: ServerHandle) {
        self.shutdown.shutdown();
        self.manager.close_all(DetachReason::Shutdown);
        let report = self
            .shutdown
            .drain(handle.tasks, Some(self.config.shutdown_timeout))
            .await;
        info!(clean = report.is_clean(), "conduit server stopped");
    }

    /// Connection manager.
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Runtime.
    pub fn runtime(&self) -> &Runtime {
        self.manager.runtime()
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let runtime = state.manager.runtime();
    Json(health::health_check(
        state.start_time,
        state.manager.connection_count(),
        runtime.registry().len(),
        runtime.registry().active_runs(),
        runtime.cascade().is_degraded(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /sessions
async fn sessions_handler(State(state): State<AppState>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: state.manager.runtime().registry().snapshot(),
        connections: state.manager.stats(),
    })
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.max_message_bytes)
        .on_upgrade(move |socket| async move {
            let (connection, outbound) = state.manager.register();
            run_ws_session(socket, state.manager, connection, outbound, state.heartbeat).await;
        })
}
