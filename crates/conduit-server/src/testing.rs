//! Runtime fixtures shared by unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::agent::{AgentContract, AgentRegistry, StageError, StageInput};
use conduit_core::context::ExecutionContext;
use conduit_core::ids::{ThreadId, UserId};
use conduit_core::stage::StageKind;
use conduit_core::tools::ToolRegistry;
use conduit_runtime::bridge::BridgedEnvelope;
use conduit_runtime::engine::RunRequest;
use conduit_runtime::{Runtime, RuntimeConfig, RuntimeDeps, StartRun};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};

pub(crate) struct TestAgent {
    name: String,
    kind: StageKind,
    gate: Option<Arc<Notify>>,
}

impl TestAgent {
    pub(crate) fn ok(name: &str, kind: StageKind) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            gate: None,
        }
    }

    pub(crate) fn gated(name: &str, kind: StageKind, gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::ok(name, kind)
        }
    }
}

#[async_trait]
impl AgentContract for TestAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn stage_kind(&self) -> StageKind {
        self.kind
    }

    async fn execute(
        &self,
        _context: &ExecutionContext,
        _input: StageInput<'_>,
    ) -> Result<Value, StageError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(json!({ "agent": self.name }))
    }
}

pub(crate) fn make_runtime(agents: Vec<TestAgent>) -> (Runtime, mpsc::UnboundedReceiver<BridgedEnvelope>) {
    let mut registry = AgentRegistry::new();
    for agent in agents {
        registry.register(Arc::new(agent));
    }
    Runtime::new(RuntimeDeps {
        config: RuntimeConfig::default(),
        agents: Arc::new(registry),
        tools: Arc::new(ToolRegistry::new()),
        archive: None,
    })
}

pub(crate) fn start(user: &str, stages: &[&str]) -> StartRun {
    StartRun::new(
        UserId::from(user),
        ThreadId::from("thread"),
        RunRequest {
            stages: stages.iter().map(|s| (*s).to_owned()).collect(),
            input: json!({}),
        },
    )
}

/// Everything currently queued on the bridge channel.
pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<BridgedEnvelope>) -> Vec<BridgedEnvelope> {
    let mut out = Vec::new();
    while let Ok(bridged) = rx.try_recv() {
        out.push(bridged);
    }
    out
}
