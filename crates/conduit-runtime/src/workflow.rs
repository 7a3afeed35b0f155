//! Drives one run's stages in dependency order.
//!
//! Ready stages are launched into a per-run [`JoinSet`]. When a stage
//! completes, the remaining-predecessor counts of its dependents drop and the
//! ones reaching zero are launched. A failed stage short-circuits every
//! transitive dependent to `failed` without running it, so the run always
//! reaches a terminal state.
//!
//! Lock order: the record lock is never held while a session lock is taken.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use conduit_core::agent::{StageError, StageInput};
use conduit_core::events::EventType;
use conduit_core::ids::RunId;
use conduit_core::stage::{AgentStatus, StageKind};
use conduit_telemetry::metrics::{
    RUNS_ACTIVE, RUNS_FINISHED_TOTAL, STAGE_DURATION_SECONDS, STAGE_FAILURES_TOTAL,
};
use futures::FutureExt;
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::{Id, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::archive::RunArchive;
use crate::bridge::{EventBridge, RunEmitter, StageProgress};
use crate::dispatcher::ToolDispatcher;
use crate::engine::{EngineHandle, RunHandle};
use crate::fallback::{CascadeMonitor, FallbackCoordinator};
use crate::plan::StagePlan;
use crate::record::RunStatus;
use crate::registry::SessionRegistry;

/// Terminal summary of a driven run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    /// Run id.
    pub run_id: RunId,
    /// Terminal status.
    pub status: RunStatus,
    /// Names of stages that ended failed, in plan order.
    pub failed_stages: Vec<String>,
}

type StageResult = (usize, Result<Value, StageError>);

/// Mutable bookkeeping of one drive.
struct Progress {
    remaining: Vec<usize>,
    ready: VecDeque<usize>,
    outputs: BTreeMap<String, Value>,
    running: HashMap<Id, (usize, Instant)>,
}

/// Executes engines built by the factory.
pub struct WorkflowOrchestrator {
    registry: Arc<SessionRegistry>,
    bridge: EventBridge,
    cascade: Arc<CascadeMonitor>,
    archive: Arc<dyn RunArchive>,
    stage_timeout: Duration,
}

impl WorkflowOrchestrator {
    /// Orchestrator over the shared registry and bridge.
    pub fn new(
        registry: Arc<SessionRegistry>,
        bridge: EventBridge,
        cascade: Arc<CascadeMonitor>,
        archive: Arc<dyn RunArchive>,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            bridge,
            cascade,
            archive,
            stage_timeout,
        }
    }

    /// Run every stage of `engine` to a terminal state and tear the run down.
    #[instrument(skip_all, fields(user_id = %engine.context().user_id(), run_id = %engine.run_id()))]
    pub async fn drive(&self, engine: EngineHandle) -> RunOutcome {
        let EngineHandle {
            plan,
            request,
            tools,
            emitter,
            run,
            session,
        } = engine;
        gauge!(RUNS_ACTIVE).increment(1.0);

        let cancelled = match self.cascade.check() {
            Err(err) => {
                warn!(%err, "shedding run");
                self.shed(&plan, &run, &emitter, &err.to_string());
                false
            }
            Ok(()) => self.execute(&plan, &request, &tools, &emitter, &run).await,
        };

        let outcome = self.finish(&plan, &emitter, &run, cancelled);

        let run_id = run.run_id().clone();
        let _ = self.bridge.close_run(&run_id);
        session.finish_run(&run_id);
        self.registry.release_run(&run_id);
        self.archive.archive(run.snapshot());

        gauge!(RUNS_ACTIVE).decrement(1.0);
        counter!(RUNS_FINISHED_TOTAL, "status" => outcome.status.as_str()).increment(1);
        info!(status = outcome.status.as_str(), failed = outcome.failed_stages.len(), "run finished");
        outcome
    }

    /// Launch and await stages. Returns whether the run was cancelled.
    async fn execute(
        &self,
        plan: &StagePlan,
        request: &Arc<Value>,
        tools: &ToolDispatcher,
        emitter: &RunEmitter,
        run: &Arc<RunHandle>,
    ) -> bool {
        let cancel = run.cancellation();
        let mut tasks: JoinSet<StageResult> = JoinSet::new();
        let mut progress = Progress {
            remaining: plan.stages().iter().map(|s| s.predecessors.len()).collect(),
            ready: plan.roots().into(),
            outputs: BTreeMap::new(),
            running: HashMap::new(),
        };

        loop {
            while let Some(index) = progress.ready.pop_front() {
                self.launch(index, plan, request, tools, emitter, run, &mut tasks, &mut progress);
            }
            if tasks.is_empty() {
                return false;
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    self.cancel_remaining(plan, emitter, run, &progress);
                    return true;
                }
                joined = tasks.join_next_with_id() => {
                    let (id, (index, result)) = match joined {
                        Some(Ok(done)) => done,
                        Some(Err(err)) => {
                            let Some((index, _)) = progress.running.get(&err.id()).copied() else {
                                continue;
                            };
                            (err.id(), (index, Err(StageError::Panicked(err.to_string()))))
                        }
                        None => return false,
                    };
                    let started = progress.running.remove(&id).map(|(_, at)| at);
                    self.settle(index, result, started, plan, emitter, run, &mut progress);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn launch(
        &self,
        index: usize,
        plan: &StagePlan,
        request: &Arc<Value>,
        tools: &ToolDispatcher,
        emitter: &RunEmitter,
        run: &Arc<RunHandle>,
        tasks: &mut JoinSet<StageResult>,
        progress: &mut Progress,
    ) {
        let stage = plan.stage(index);
        if let Err(err) = run.update(|r| r.start_stage(index)) {
            error!(stage = %stage.name, %err, "stage refused to start");
            self.settle(
                index,
                Err(StageError::Failed(err.to_string())),
                None,
                plan,
                emitter,
                run,
                progress,
            );
            return;
        }
        emit(
            emitter,
            plan,
            index,
            EventType::AgentStarted,
            json!({ "tools": stage.tools }),
        );

        let agent = Arc::clone(&stage.agent);
        let request = Arc::clone(request);
        let upstream = progress.outputs.clone();
        let stage_tools = tools.for_stage(&stage.name, stage.kind, stage.tools.clone());
        let reporter = StageProgress::new(emitter.clone(), stage.name.clone(), stage.kind);
        let run = Arc::clone(run);
        let budget = self.stage_timeout;

        let handle = tasks.spawn(async move {
            let call = async {
                let input = StageInput {
                    request: &request,
                    upstream: &upstream,
                    tools: &stage_tools,
                    progress: &reporter,
                };
                agent.execute(run.context(), input).await
            };
            let result = match tokio::time::timeout(budget, AssertUnwindSafe(call).catch_unwind()).await {
                Ok(Ok(result)) => result,
                Ok(Err(panic)) => Err(StageError::Panicked(panic_message(&*panic))),
                Err(_) => Err(StageError::Timeout(budget)),
            };
            (index, result)
        });
        let _ = progress.running.insert(handle.id(), (index, Instant::now()));
        debug!(stage = %stage.name, "stage launched");
    }

    /// Record a stage result and release or short-circuit its dependents.
    #[allow(clippy::too_many_arguments)]
    fn settle(
        &self,
        index: usize,
        result: Result<Value, StageError>,
        started: Option<Instant>,
        plan: &StagePlan,
        emitter: &RunEmitter,
        run: &RunHandle,
        progress: &mut Progress,
    ) {
        let stage = plan.stage(index);
        let status = if result.is_ok() { "completed" } else { "failed" };
        if let Some(at) = started {
            histogram!(
                STAGE_DURATION_SECONDS,
                "stage_kind" => stage.kind.as_str(),
                "status" => status
            )
            .record(at.elapsed().as_secs_f64());
        }

        match result {
            Ok(output) => {
                if let Err(err) = run.update(|r| r.complete_stage(index)) {
                    error!(stage = %stage.name, %err, "completion rejected");
                }
                emit(
                    emitter,
                    plan,
                    index,
                    EventType::AgentCompleted,
                    json!({ "status": "completed", "output": output }),
                );
                let _ = progress.outputs.insert(stage.name.clone(), output);
                for &dependent in &stage.dependents {
                    progress.remaining[dependent] = progress.remaining[dependent].saturating_sub(1);
                    let pending = run.update(|r| r.status_of(dependent)) == Some(AgentStatus::Pending);
                    if progress.remaining[dependent] == 0 && pending {
                        progress.ready.push_back(dependent);
                    }
                }
            }
            Err(err) => {
                warn!(stage = %stage.name, code = err.code(), %err, "stage failed");
                self.fail(index, &err, plan, emitter, run);
                let upstream = StageError::UpstreamFailed(stage.name.clone());
                for dependent in plan.transitive_dependents(index) {
                    if run.update(|r| r.status_of(dependent)) == Some(AgentStatus::Pending) {
                        self.fail(dependent, &upstream, plan, emitter, run);
                    }
                }
            }
        }
    }

    /// Mark one stage failed and emit its `agent_completed` with a fallback.
    fn fail(
        &self,
        index: usize,
        err: &StageError,
        plan: &StagePlan,
        emitter: &RunEmitter,
        run: &RunHandle,
    ) {
        let stage = plan.stage(index);
        let detail = err.to_string();
        if let Err(rejected) = run.update(|r| r.fail_stage(index, &detail)) {
            error!(stage = %stage.name, err = %rejected, "failure rejected");
            return;
        }
        let cancelled = matches!(err, StageError::Cancelled);
        let never_ran = run.update(|r| r.agents.get(index).is_some_and(|a| a.started_at.is_none()));
        if !err.is_skip() && !cancelled {
            self.cascade.record_failure(run.run_id());
        }
        counter!(STAGE_FAILURES_TOTAL, "stage_kind" => stage.kind.as_str(), "code" => err.code())
            .increment(1);
        emit(
            emitter,
            plan,
            index,
            EventType::AgentCompleted,
            json!({
                "status": "failed",
                "error": detail,
                "error_code": err.code(),
                "skipped": err.is_skip() || (cancelled && never_ran),
                "fallback": self.fallback_for(stage.kind, &detail),
            }),
        );
    }

    /// Fail every stage without invoking it.
    fn shed(&self, plan: &StagePlan, run: &RunHandle, emitter: &RunEmitter, reason: &str) {
        let err = StageError::LoadShed(reason.to_owned());
        for index in 0..plan.len() {
            self.fail(index, &err, plan, emitter, run);
        }
    }

    /// After cancellation: running and pending stages end failed.
    fn cancel_remaining(
        &self,
        plan: &StagePlan,
        emitter: &RunEmitter,
        run: &RunHandle,
        progress: &Progress,
    ) {
        let mut open: Vec<usize> = progress.running.values().map(|(i, _)| *i).collect();
        open.extend(run.update(|r| r.indices_with(AgentStatus::Pending)));
        open.sort_unstable();
        open.dedup();
        info!(stages = open.len(), "run cancelled");
        for index in open {
            self.fail(index, &StageError::Cancelled, plan, emitter, run);
        }
    }

    /// Terminal status, record finish, and the terminal event.
    fn finish(
        &self,
        plan: &StagePlan,
        emitter: &RunEmitter,
        run: &RunHandle,
        cancelled: bool,
    ) -> RunOutcome {
        let record = run.snapshot();
        let failed_stages: Vec<String> = record.failed_agents().map(|a| a.name.clone()).collect();
        let status = if cancelled {
            RunStatus::Cancelled
        } else if failed_stages.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        let stages: Vec<Value> = record
            .agents
            .iter()
            .map(|a| json!({ "agent_name": a.name, "stage_kind": a.stage_kind.as_str(), "status": a.status.as_str() }))
            .collect();

        let (event_type, payload, fallback) = if status == RunStatus::Completed {
            (
                EventType::RunCompleted,
                json!({ "status": status.as_str(), "stages": stages }),
                None,
            )
        } else {
            let first = record.failed_agents().next();
            let reason = match status {
                RunStatus::Cancelled => "run cancelled".to_owned(),
                _ => first
                    .and_then(|a| a.error.clone())
                    .unwrap_or_else(|| "run failed".to_owned()),
            };
            let kind = first.map_or(plan.stage(0).kind, |a| a.stage_kind);
            let fallback = self.fallback_for(kind, &reason);
            (
                EventType::RunFailed,
                json!({
                    "status": status.as_str(),
                    "stages": stages,
                    "failed_stages": failed_stages,
                    "error": reason,
                    "fallback": fallback,
                }),
                Some(fallback),
            )
        };

        run.update(|r| r.finish(status, fallback));
        if let Err(err) = emitter.emit(event_type, payload) {
            error!(%err, "terminal event not emitted");
        }
        RunOutcome {
            run_id: record.run_id.clone(),
            status,
            failed_stages,
        }
    }

    fn fallback_for(&self, kind: StageKind, reason: &str) -> Value {
        if self.cascade.is_degraded() {
            let (_, runs) = self.cascade.counts();
            FallbackCoordinator::cascade_prevention_response(runs, reason)
        } else {
            FallbackCoordinator::emergency_response(kind, reason)
        }
    }
}

fn emit(emitter: &RunEmitter, plan: &StagePlan, index: usize, event_type: EventType, extra: Value) {
    let stage = plan.stage(index);
    if let Err(err) = emitter.emit_stage(event_type, &stage.name, stage.kind, extra) {
        debug!(stage = %stage.name, %err, "stage event dropped");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemoryRunArchive;
    use crate::bridge::BridgedEnvelope;
    use crate::engine::{ExecutionEngineFactory, RunRequest};
    use crate::fallback::CascadeConfig;
    use crate::testing::{registry_of, EchoTool, Script, ScriptedAgent};
    use conduit_core::context::ExecutionContext;
    use conduit_core::events::EventEnvelope;
    use conduit_core::ids::{ThreadId, UserId};
    use conduit_core::tools::ToolRegistry;
    use std::sync::atomic::Ordering;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        factory: ExecutionEngineFactory,
        orchestrator: Arc<WorkflowOrchestrator>,
        registry: Arc<SessionRegistry>,
        bridge: EventBridge,
        archive: Arc<MemoryRunArchive>,
        cascade: Arc<CascadeMonitor>,
        rx: UnboundedReceiver<BridgedEnvelope>,
    }

    fn make_harness(agents: Vec<ScriptedAgent>, stage_timeout: Duration) -> Harness {
        let registry = Arc::new(SessionRegistry::new());
        let (bridge, rx) = EventBridge::new();
        let archive = Arc::new(MemoryRunArchive::new(16));
        let cascade = Arc::new(CascadeMonitor::new(CascadeConfig {
            window: Duration::from_secs(60),
            failure_threshold: 3,
            min_distinct_runs: 2,
        }));
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(EchoTool));
        let factory = ExecutionEngineFactory::new(
            Arc::clone(&registry),
            Arc::new(registry_of(agents)),
            Arc::new(tools),
            bridge.clone(),
        );
        let orchestrator = Arc::new(WorkflowOrchestrator::new(
            Arc::clone(&registry),
            bridge.clone(),
            Arc::clone(&cascade),
            Arc::clone(&archive) as Arc<dyn RunArchive>,
            stage_timeout,
        ));
        Harness {
            factory,
            orchestrator,
            registry,
            bridge,
            archive,
            cascade,
            rx,
        }
    }

    impl Harness {
        fn engine(&self, user: &str, run: &str, stages: &[&str]) -> EngineHandle {
            let ctx = ExecutionContext::builder(UserId::from(user), ThreadId::from("t"))
                .run_id(RunId::from(run))
                .build();
            let request = RunRequest {
                stages: stages.iter().map(|s| (*s).to_owned()).collect(),
                input: json!({"account": 42}),
            };
            self.factory.create_for_user(ctx, &request).unwrap()
        }

        fn drain(&mut self) -> Vec<EventEnvelope> {
            let mut events = Vec::new();
            while let Ok(bridged) = self.rx.try_recv() {
                events.push(bridged.envelope);
            }
            events
        }
    }

    fn position(events: &[EventEnvelope], ty: EventType, agent: &str) -> usize {
        events
            .iter()
            .position(|e| e.event_type == ty && e.payload["agent_name"] == agent)
            .unwrap()
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn data_tier_completes_before_optimization_starts() {
        let mut h = make_harness(
            vec![
                ScriptedAgent::ok("d1", StageKind::Data),
                ScriptedAgent::ok("d2", StageKind::Data),
                ScriptedAgent::ok("opt", StageKind::Optimization),
            ],
            TIMEOUT,
        );
        let engine = h.engine("alice", "r1", &["d1", "d2", "opt"]);
        let outcome = h.orchestrator.drive(engine).await;
        assert_eq!(outcome.status, RunStatus::Completed);
        assert!(outcome.failed_stages.is_empty());

        let events = h.drain();
        let seqs: Vec<u64> = events.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, (1..=events.len() as u64).collect::<Vec<_>>());
        let opt_started = position(&events, EventType::AgentStarted, "opt");
        assert!(position(&events, EventType::AgentCompleted, "d1") < opt_started);
        assert!(position(&events, EventType::AgentCompleted, "d2") < opt_started);

        let opt_done = &events[position(&events, EventType::AgentCompleted, "opt")];
        let upstream = &opt_done.payload["output"]["upstream"];
        assert_eq!(upstream, &json!(["d1", "d2"]));
        assert_eq!(opt_done.payload["output"]["user"], "alice");
        assert_eq!(events.last().unwrap().event_type, EventType::RunCompleted);
    }

    #[tokio::test]
    async fn failed_data_stage_short_circuits_optimization() {
        let opt = ScriptedAgent::ok("opt", StageKind::Optimization);
        let opt_calls = opt.calls();
        let mut h = make_harness(
            vec![
                ScriptedAgent::ok("d1", StageKind::Data),
                ScriptedAgent::failing("d2", StageKind::Data, "quota exceeded"),
                opt,
            ],
            TIMEOUT,
        );
        let engine = h.engine("alice", "r1", &["d1", "d2", "opt"]);
        let outcome = h.orchestrator.drive(engine).await;

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.failed_stages, vec!["d2", "opt"]);
        assert_eq!(opt_calls.load(Ordering::SeqCst), 0);

        let record = h.archive.find(&RunId::from("r1")).unwrap();
        assert_eq!(record.agents[0].status, AgentStatus::Completed);
        assert_eq!(record.agents[1].status, AgentStatus::Failed);
        assert_eq!(record.agents[2].status, AgentStatus::Failed);
        assert!(record.agents[2].started_at.is_none());
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.fallback.is_some());

        let events = h.drain();
        assert!(!events
            .iter()
            .any(|e| e.event_type == EventType::AgentStarted && e.payload["agent_name"] == "opt"));
        let skipped = &events[position(&events, EventType::AgentCompleted, "opt")];
        assert_eq!(skipped.payload["status"], "failed");
        assert_eq!(skipped.payload["skipped"], true);
        assert_eq!(skipped.payload["fallback"]["kind"], "emergency");

        let terminal = events.last().unwrap();
        assert_eq!(terminal.event_type, EventType::RunFailed);
        assert_eq!(terminal.payload["fallback"]["kind"], "emergency");
        assert_eq!(terminal.payload["error"], "quota exceeded");

        assert!(h.registry.owner_of(&RunId::from("r1")).is_none());
        assert_eq!(h.bridge.open_streams(), 0);
        assert_eq!(
            h.registry.get(&UserId::from("alice")).unwrap().active_run_count(),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_stage_times_out() {
        let mut h = make_harness(
            vec![ScriptedAgent::new(
                "slow",
                StageKind::Data,
                Script::Sleep(Duration::from_secs(30)),
            )],
            Duration::from_secs(1),
        );
        let engine = h.engine("alice", "r1", &["slow"]);
        let outcome = h.orchestrator.drive(engine).await;
        assert_eq!(outcome.status, RunStatus::Failed);
        let events = h.drain();
        let done = &events[position(&events, EventType::AgentCompleted, "slow")];
        assert_eq!(done.payload["error_code"], "timeout");
    }

    #[tokio::test]
    async fn panicking_stage_is_contained() {
        let mut h = make_harness(
            vec![
                ScriptedAgent::new("boom", StageKind::Data, Script::Panic),
                ScriptedAgent::ok("other", StageKind::Data),
            ],
            TIMEOUT,
        );
        let engine = h.engine("alice", "r1", &["boom", "other"]);
        let outcome = h.orchestrator.drive(engine).await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.failed_stages, vec!["boom"]);
        let events = h.drain();
        let done = &events[position(&events, EventType::AgentCompleted, "boom")];
        assert_eq!(done.payload["error_code"], "panicked");
        let other = &events[position(&events, EventType::AgentCompleted, "other")];
        assert_eq!(other.payload["status"], "completed");
    }

    #[tokio::test]
    async fn cancellation_fails_running_and_pending_stages() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let mut h = make_harness(
            vec![
                ScriptedAgent::new("wait", StageKind::Data, Script::Gate(Arc::clone(&gate))),
                ScriptedAgent::ok("report", StageKind::Reporting),
            ],
            TIMEOUT,
        );
        let engine = h.engine("alice", "r1", &["wait", "report"]);
        let run = Arc::clone(engine.run());
        let orchestrator = Arc::clone(&h.orchestrator);
        let driver = tokio::spawn(async move { orchestrator.drive(engine).await });

        loop {
            let bridged = h.rx.recv().await.unwrap();
            if bridged.envelope.event_type == EventType::AgentStarted {
                break;
            }
        }
        run.cancel();
        let outcome = driver.await.unwrap();
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(outcome.failed_stages, vec!["wait", "report"]);

        let events = h.drain();
        let report = &events[position(&events, EventType::AgentCompleted, "report")];
        assert_eq!(report.payload["error_code"], "cancelled");
        assert_eq!(report.payload["skipped"], true);
        let terminal = events.last().unwrap();
        assert_eq!(terminal.event_type, EventType::RunFailed);
        assert_eq!(terminal.payload["status"], "cancelled");
        assert_eq!(h.archive.find(&RunId::from("r1")).unwrap().status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn degraded_system_sheds_without_invoking_stages() {
        let d1 = ScriptedAgent::ok("d1", StageKind::Data);
        let calls = d1.calls();
        let mut h = make_harness(vec![d1], TIMEOUT);
        for run in ["x1", "x2", "x3"] {
            h.cascade.record_failure(&RunId::from(run));
        }
        let engine = h.engine("alice", "r1", &["d1"]);
        let outcome = h.orchestrator.drive(engine).await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let events = h.drain();
        let done = &events[position(&events, EventType::AgentCompleted, "d1")];
        assert_eq!(done.payload["error_code"], "load_shed");
        let terminal = events.last().unwrap();
        assert_eq!(terminal.payload["fallback"]["kind"], "cascade_prevention");
    }

    #[tokio::test]
    async fn partial_results_stream_between_start_and_completion() {
        let mut h = make_harness(
            vec![ScriptedAgent::new("stream", StageKind::Reporting, Script::Stream(3))],
            TIMEOUT,
        );
        let engine = h.engine("alice", "r1", &["stream"]);
        let _ = h.orchestrator.drive(engine).await;
        let types: Vec<EventType> = h.drain().into_iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                EventType::AgentStarted,
                EventType::PartialResult,
                EventType::PartialResult,
                EventType::PartialResult,
                EventType::AgentCompleted,
                EventType::RunCompleted,
            ]
        );
    }

    #[tokio::test]
    async fn concurrent_runs_of_different_users_stay_isolated() {
        let mut h = make_harness(
            vec![
                ScriptedAgent::ok("d1", StageKind::Data),
                ScriptedAgent::ok("opt", StageKind::Optimization),
            ],
            TIMEOUT,
        );
        let a = h.engine("alice", "ra", &["d1", "opt"]);
        let b = h.engine("bob", "rb", &["d1", "opt"]);
        let (oa, ob) = tokio::join!(h.orchestrator.drive(a), h.orchestrator.drive(b));
        assert_eq!(oa.status, RunStatus::Completed);
        assert_eq!(ob.status, RunStatus::Completed);

        let mut alice = Vec::new();
        let mut bob = Vec::new();
        while let Ok(bridged) = h.rx.try_recv() {
            match bridged.user_id.as_str() {
                "alice" => alice.push(bridged.envelope),
                _ => bob.push(bridged.envelope),
            }
        }
        assert!(alice.iter().all(|e| e.run_id.as_str() == "ra"));
        assert!(bob.iter().all(|e| e.run_id.as_str() == "rb"));
        for events in [&alice, &bob] {
            let seqs: Vec<u64> = events.iter().map(|e| e.sequence_number).collect();
            assert_eq!(seqs, (1..=events.len() as u64).collect::<Vec<_>>());
            let user = events
                .iter()
                .find(|e| e.event_type == EventType::AgentCompleted)
                .map(|e| e.payload["output"]["user"].clone())
                .unwrap();
            let expected = if events[0].run_id.as_str() == "ra" { "alice" } else { "bob" };
            assert_eq!(user, json!(expected));
        }
    }

    #[tokio::test]
    async fn explicit_dependency_orders_same_tier_stages() {
        let mut h = make_harness(
            vec![
                ScriptedAgent::ok("accounts", StageKind::Data),
                ScriptedAgent::ok("usage", StageKind::Data).depends_on(&["accounts"]),
            ],
            TIMEOUT,
        );
        let engine = h.engine("alice", "r1", &["usage", "accounts"]);
        let outcome = h.orchestrator.drive(engine).await;
        assert_eq!(outcome.status, RunStatus::Completed);
        let events = h.drain();
        assert!(
            position(&events, EventType::AgentCompleted, "accounts")
                < position(&events, EventType::AgentStarted, "usage")
        );
    }

    #[tokio::test]
    async fn stage_tool_calls_are_announced() {
        let mut h = make_harness(
            vec![ScriptedAgent::new(
                "lookup",
                StageKind::Data,
                Script::CallTool("echo".into(), json!({"text": "hi"})),
            )
            .tools(&["echo"])],
            TIMEOUT,
        );
        let engine = h.engine("alice", "r1", &["lookup"]);
        let outcome = h.orchestrator.drive(engine).await;
        assert_eq!(outcome.status, RunStatus::Completed);
        let events = h.drain();
        let call = &events[position(&events, EventType::ToolExecuting, "lookup")];
        assert_eq!(call.payload["tool"], "echo");
        let done = &events[position(&events, EventType::AgentCompleted, "lookup")];
        assert_eq!(done.payload["output"]["tool_output"]["echo"], "hi");
    }

    #[tokio::test]
    async fn undeclared_tool_call_fails_the_stage() {
        let mut h = make_harness(
            vec![ScriptedAgent::new(
                "sneaky",
                StageKind::Data,
                Script::CallTool("echo".into(), json!({"text": "hi"})),
            )],
            TIMEOUT,
        );
        let engine = h.engine("alice", "r1", &["sneaky"]);
        let outcome = h.orchestrator.drive(engine).await;
        assert_eq!(outcome.status, RunStatus::Failed);
        let events = h.drain();
        let done = &events[position(&events, EventType::AgentCompleted, "sneaky")];
        assert_eq!(done.payload["error_code"], "tool");
    }
}
