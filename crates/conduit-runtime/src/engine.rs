//! Isolated per-run execution engines and the factory that builds them.
//!
//! Construction is all-or-nothing: the run id is claimed first, and if any
//! later step fails the claim is released and nothing is left registered.

use std::sync::Arc;

use conduit_core::agent::AgentRegistry;
use conduit_core::context::ExecutionContext;
use conduit_core::ids::RunId;
use conduit_core::tools::ToolRegistry;
use conduit_telemetry::metrics::RUNS_STARTED_TOTAL;
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::bridge::{EventBridge, RunEmitter};
use crate::dispatcher::ToolDispatcher;
use crate::errors::RuntimeError;
use crate::plan::StagePlan;
use crate::record::RunRecord;
use crate::registry::SessionRegistry;
use crate::session::{RegisterError, UserSession};

/// Stages and input of a run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Agent names to run.
    pub stages: Vec<String>,
    /// Request body passed to every stage.
    #[serde(default)]
    pub input: Value,
}

/// Shared view of an active run: its context, record, and cancellation.
pub struct RunHandle {
    context: ExecutionContext,
    record: Mutex<RunRecord>,
    cancel: CancellationToken,
}

impl RunHandle {
    /// Handle for a freshly built record.
    pub fn new(context: ExecutionContext, record: RunRecord) -> Self {
        Self {
            context,
            record: Mutex::new(record),
            cancel: CancellationToken::new(),
        }
    }

    /// Run id.
    pub fn run_id(&self) -> &RunId {
        self.context.run_id()
    }

    /// Execution context.
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token the orchestrator waits on.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Copy of the current record.
    pub fn snapshot(&self) -> RunRecord {
        self.record.lock().clone()
    }

    /// Mutate the record under its lock.
    pub fn update<T>(&self, f: impl FnOnce(&mut RunRecord) -> T) -> T {
        f(&mut self.record.lock())
    }

    pub(crate) fn record_size(&self) -> usize {
        self.record.lock().approx_size()
    }
}

/// Everything one run needs, built fresh for that run.
pub struct EngineHandle {
    pub(crate) plan: StagePlan,
    pub(crate) request: Arc<Value>,
    pub(crate) tools: ToolDispatcher,
    pub(crate) emitter: RunEmitter,
    pub(crate) run: Arc<RunHandle>,
    pub(crate) session: Arc<UserSession>,
}

impl EngineHandle {
    /// Execution context.
    pub fn context(&self) -> &ExecutionContext {
        self.run.context()
    }

    /// Run id.
    pub fn run_id(&self) -> &RunId {
        self.run.run_id()
    }

    /// Shared run handle.
    pub fn run(&self) -> &Arc<RunHandle> {
        &self.run
    }

    /// Planned stage names in request order.
    pub fn stage_names(&self) -> Vec<String> {
        self.plan.names()
    }
}

/// Releases a run claim unless committed.
struct RunClaim<'a> {
    registry: &'a SessionRegistry,
    run_id: RunId,
    committed: bool,
}

impl RunClaim<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for RunClaim<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.release_run(&self.run_id);
            debug!(run_id = %self.run_id, "run claim rolled back");
        }
    }
}

/// Builds one isolated engine per (user, run).
pub struct ExecutionEngineFactory {
    registry: Arc<SessionRegistry>,
    agents: Arc<AgentRegistry>,
    tools: Arc<ToolRegistry>,
    bridge: EventBridge,
}

impl ExecutionEngineFactory {
    /// Factory over shared read-only registries.
    pub fn new(
        registry: Arc<SessionRegistry>,
        agents: Arc<AgentRegistry>,
        tools: Arc<ToolRegistry>,
        bridge: EventBridge,
    ) -> Self {
        Self {
            registry,
            agents,
            tools,
            bridge,
        }
    }

    /// Build an engine for `context` and register the run in the user's session.
    #[instrument(skip_all, fields(user_id = %context.user_id(), run_id = %context.run_id()))]
    pub fn create_for_user(
        &self,
        context: ExecutionContext,
        request: &RunRequest,
    ) -> Result<EngineHandle, RuntimeError> {
        context.validate()?;
        let run_id = context.run_id().clone();
        if !self.registry.claim_run(&run_id, context.user_id()) {
            return Err(RuntimeError::DuplicateRun(run_id));
        }
        let claim = RunClaim {
            registry: &self.registry,
            run_id: run_id.clone(),
            committed: false,
        };

        let construction = |reason: String| RuntimeError::EngineConstruction {
            run_id: run_id.clone(),
            reason,
        };

        let plan = StagePlan::build(&self.agents, &request.stages)
            .map_err(|e| construction(e.to_string()))?;
        for stage in plan.stages() {
            if let Some(missing) = stage.tools.iter().find(|t| !self.tools.contains(t)) {
                return Err(construction(format!(
                    "stage `{}` requires unknown tool `{missing}`",
                    stage.name
                )));
            }
        }

        let record = RunRecord::new(&context, plan.instances());
        let run = Arc::new(RunHandle::new(context, record));
        let emitter = self
            .bridge
            .open_run(run.context())
            .map_err(|e| construction(e.to_string()))?;
        let tools = ToolDispatcher::new(Arc::clone(&self.tools), emitter.clone());

        let session = match self.register(&run) {
            Ok(session) => session,
            Err(err) => {
                let _ = self.bridge.close_run(&run_id);
                return Err(err);
            }
        };

        claim.commit();
        counter!(RUNS_STARTED_TOTAL).increment(1);
        info!(stages = plan.len(), "engine constructed");
        Ok(EngineHandle {
            plan,
            request: Arc::new(request.input.clone()),
            tools,
            emitter,
            run,
            session,
        })
    }

    /// Register with the user's session, replacing a session that was
    /// sealed by a concurrent reclamation.
    fn register(&self, run: &Arc<RunHandle>) -> Result<Arc<UserSession>, RuntimeError> {
        let user_id = run.context().user_id();
        for _ in 0..3 {
            let session = self.registry.resolve_or_create(user_id);
            match session.register_run(Arc::clone(run)) {
                Ok(()) => return Ok(session),
                Err(RegisterError::DuplicateRun) => {
                    return Err(RuntimeError::DuplicateRun(run.run_id().clone()));
                }
                Err(RegisterError::Sealed) => {
                    warn!("session sealed during construction, retrying");
                    let _ = self.registry.remove_if_same(user_id, &session);
                }
            }
        }
        Err(RuntimeError::EngineConstruction {
            run_id: run.run_id().clone(),
            reason: "session kept being reclaimed".into(),
        })
    }
}
