//! Wiring of registry, bridge, factory, orchestrator, and lifecycle into one
//! cloneable handle.

use std::sync::Arc;
use std::time::Duration;

use conduit_core::agent::AgentRegistry;
use conduit_core::context::ExecutionContext;
use conduit_core::ids::{ConnectionId, RequestId, RunId, ThreadId, UserId};
use conduit_core::tools::ToolRegistry;
use conduit_settings::ConduitSettings;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::archive::{MemoryRunArchive, RunArchive};
use crate::bridge::{BridgedEnvelope, EventBridge};
use crate::engine::{ExecutionEngineFactory, RunRequest};
use crate::errors::RuntimeError;
use crate::fallback::{CascadeConfig, CascadeMonitor};
use crate::lifecycle::{LifecycleConfig, LifecycleManager};
use crate::registry::SessionRegistry;
use crate::workflow::{RunOutcome, WorkflowOrchestrator};

/// Runtime tuning, usually derived from settings.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Per-stage time budget.
    pub stage_timeout: Duration,
    /// Reclamation thresholds.
    pub lifecycle: LifecycleConfig,
    /// Cascade window.
    pub cascade: CascadeConfig,
    /// Records kept by the default in-memory archive.
    pub archive_capacity: usize,
}

impl RuntimeConfig {
    /// From loaded settings.
    pub fn from_settings(settings: &ConduitSettings) -> Self {
        Self {
            stage_timeout: Duration::from_millis(settings.orchestration.stage_timeout_ms),
            lifecycle: LifecycleConfig::from_settings(&settings.lifecycle),
            cascade: CascadeConfig::from_settings(&settings.cascade),
            archive_capacity: settings.lifecycle.archive_capacity,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_settings(&ConduitSettings::default())
    }
}

/// Collaborators handed to [`Runtime::new`].
pub struct RuntimeDeps {
    /// Tuning.
    pub config: RuntimeConfig,
    /// Registered pipeline stages.
    pub agents: Arc<AgentRegistry>,
    /// Registered tools.
    pub tools: Arc<ToolRegistry>,
    /// Finished-run sink. Defaults to a bounded in-memory archive.
    pub archive: Option<Arc<dyn RunArchive>>,
}

/// A run start request.
#[derive(Clone, Debug)]
pub struct StartRun {
    /// Requesting user.
    pub user_id: UserId,
    /// Conversation thread.
    pub thread_id: ThreadId,
    /// Stages and input.
    pub request: RunRequest,
    /// Caller-chosen run id. Generated when absent.
    pub run_id: Option<RunId>,
    /// Caller-chosen request id. Generated when absent.
    pub request_id: Option<RequestId>,
    /// Connection the request arrived on.
    pub connection_id: Option<ConnectionId>,
}

impl StartRun {
    /// Request with generated ids.
    pub fn new(user_id: UserId, thread_id: ThreadId, request: RunRequest) -> Self {
        Self {
            user_id,
            thread_id,
            request,
            run_id: None,
            request_id: None,
            connection_id: None,
        }
    }
}

/// An accepted run.
#[derive(Debug)]
pub struct RunStarted {
    /// Run id.
    pub run_id: RunId,
    /// Thread id.
    pub thread_id: ThreadId,
    /// Stage names in plan order.
    pub stages: Vec<String>,
    /// Orchestrator task.
    pub join: JoinHandle<RunOutcome>,
}

struct Inner {
    registry: Arc<SessionRegistry>,
    bridge: EventBridge,
    factory: ExecutionEngineFactory,
    orchestrator: Arc<WorkflowOrchestrator>,
    cascade: Arc<CascadeMonitor>,
    lifecycle: Arc<LifecycleManager>,
    archive: Arc<dyn RunArchive>,
}

/// Cloneable handle to one runtime instance.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl Runtime {
    /// Build a runtime. The receiver carries every emitted envelope and is
    /// meant for the connection layer's dispatch task.
    pub fn new(deps: RuntimeDeps) -> (Self, mpsc::UnboundedReceiver<BridgedEnvelope>) {
        let RuntimeDeps {
            config,
            agents,
            tools,
            archive,
        } = deps;
        let registry = Arc::new(SessionRegistry::new());
        let (bridge, rx) = EventBridge::new();
        let cascade = Arc::new(CascadeMonitor::new(config.cascade.clone()));
        let archive = archive.unwrap_or_else(|| {
            Arc::new(MemoryRunArchive::new(config.archive_capacity)) as Arc<dyn RunArchive>
        });
        let factory =
            ExecutionEngineFactory::new(Arc::clone(&registry), agents, tools, bridge.clone());
        let orchestrator = Arc::new(WorkflowOrchestrator::new(
            Arc::clone(&registry),
            bridge.clone(),
            Arc::clone(&cascade),
            Arc::clone(&archive),
            config.stage_timeout,
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::clone(&registry),
            config.lifecycle.clone(),
        ));
        let runtime = Self {
            inner: Arc::new(Inner {
                registry,
                bridge,
                factory,
                orchestrator,
                cascade,
                lifecycle,
                archive,
            }),
        };
        (runtime, rx)
    }

    /// Construct an engine for the run and spawn its orchestrator.
    ///
    /// Only precondition failures are returned; stage failures surface as a
    /// terminal `run_failed` event.
    #[instrument(skip_all, fields(user_id = %start.user_id))]
    pub fn start_run(&self, start: StartRun) -> Result<RunStarted, RuntimeError> {
        let StartRun {
            user_id,
            thread_id,
            request,
            run_id,
            request_id,
            connection_id,
        } = start;
        let mut builder = ExecutionContext::builder(user_id, thread_id.clone());
        if let Some(run_id) = run_id {
            builder = builder.run_id(run_id);
        }
        if let Some(request_id) = request_id {
            builder = builder.request_id(request_id);
        }
        if let Some(connection_id) = connection_id {
            builder = builder.connection_id(connection_id);
        }

        let engine = self.inner.factory.create_for_user(builder.build(), &request)?;
        let run_id = engine.run_id().clone();
        let stages = engine.stage_names();
        let orchestrator = Arc::clone(&self.inner.orchestrator);
        let join = tokio::spawn(async move { orchestrator.drive(engine).await });
        info!(%run_id, stages = stages.len(), "run started");
        Ok(RunStarted {
            run_id,
            thread_id,
            stages,
            join,
        })
    }

    /// Cancel a run owned by `user_id`. `Ok(false)` if it was already
    /// cancelled; other users' runs are `RunNotFound`.
    pub fn cancel_run(&self, user_id: &UserId, run_id: &RunId) -> Result<bool, RuntimeError> {
        let handle = self
            .inner
            .registry
            .find_run(user_id, run_id)
            .ok_or_else(|| RuntimeError::RunNotFound(run_id.clone()))?;
        let first = !handle.is_cancelled();
        handle.cancel();
        info!(%user_id, %run_id, "run cancellation requested");
        Ok(first)
    }

    /// Session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    /// Event bridge.
    pub fn bridge(&self) -> &EventBridge {
        &self.inner.bridge
    }

    /// Lifecycle manager.
    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.inner.lifecycle
    }

    /// Cascade monitor.
    pub fn cascade(&self) -> &Arc<CascadeMonitor> {
        &self.inner.cascade
    }

    /// Finished-run archive.
    pub fn archive(&self) -> &Arc<dyn RunArchive> {
        &self.inner.archive
    }
}
