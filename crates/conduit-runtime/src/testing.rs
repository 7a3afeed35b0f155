//! Scripted agents and sinks shared by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::agent::{AgentContract, AgentRegistry, StageError, StageInput};
use conduit_core::context::ExecutionContext;
use conduit_core::events::EventEnvelope;
use conduit_core::ids::ConnectionId;
use conduit_core::stage::StageKind;
use conduit_core::tools::{Tool, ToolError};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::session::{ConnectionSink, DetachReason};

#[derive(Clone)]
pub(crate) enum Script {
    Succeed,
    Fail(String),
    Panic,
    Sleep(Duration),
    Gate(Arc<Notify>),
    CallTool(String, Value),
    Stream(usize),
}

#[derive(Clone)]
pub(crate) struct ScriptedAgent {
    name: String,
    kind: StageKind,
    deps: Vec<String>,
    tools: Vec<String>,
    script: Script,
    calls: Arc<AtomicUsize>,
}

impl ScriptedAgent {
    pub(crate) fn new(name: &str, kind: StageKind, script: Script) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            deps: Vec::new(),
            tools: Vec::new(),
            script,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn ok(name: &str, kind: StageKind) -> Self {
        Self::new(name, kind, Script::Succeed)
    }

    pub(crate) fn failing(name: &str, kind: StageKind, message: &str) -> Self {
        Self::new(name, kind, Script::Fail(message.to_owned()))
    }

    pub(crate) fn depends_on(mut self, deps: &[&str]) -> Self {
        self.deps = deps.iter().map(|d| (*d).to_owned()).collect();
        self
    }

    pub(crate) fn tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|t| (*t).to_owned()).collect();
        self
    }

    pub(crate) fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl AgentContract for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn stage_kind(&self) -> StageKind {
        self.kind
    }

    fn depends_on(&self) -> Vec<String> {
        self.deps.clone()
    }

    fn required_tools(&self) -> Vec<String> {
        self.tools.clone()
    }

    async fn execute(
        &self,
        context: &ExecutionContext,
        input: StageInput<'_>,
    ) -> Result<Value, StageError> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        let upstream: Vec<&String> = input.upstream.keys().collect();
        match &self.script {
            Script::Succeed => {}
            Script::Fail(message) => return Err(StageError::Failed(message.clone())),
            Script::Panic => panic!("scripted panic in {}", self.name),
            Script::Sleep(duration) => tokio::time::sleep(*duration).await,
            Script::Gate(gate) => gate.notified().await,
            Script::CallTool(tool, args) => {
                let out = input.tools.invoke(tool, args.clone()).await?;
                return Ok(json!({"stage": self.name, "tool_output": out}));
            }
            Script::Stream(count) => {
                for i in 0..*count {
                    input.progress.partial(json!({"chunk": i}));
                }
            }
        }
        Ok(json!({
            "stage": self.name,
            "user": context.user_id().as_str(),
            "upstream": upstream,
        }))
    }
}

pub(crate) fn registry_of(agents: Vec<ScriptedAgent>) -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    for agent in agents {
        registry.register(Arc::new(agent));
    }
    registry
}

/// Tool that echoes its `text` field.
pub(crate) struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "required": ["text"]})
    }

    async fn call(&self, input: Value) -> Result<Value, ToolError> {
        Ok(json!({"echo": input["text"]}))
    }
}

/// Sink that records what it receives and can refuse after a budget.
pub(crate) struct RecordingSink {
    id: ConnectionId,
    received: Mutex<Vec<EventEnvelope>>,
    accept_limit: Option<usize>,
    closed: Mutex<Option<DetachReason>>,
}

impl RecordingSink {
    pub(crate) fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::from(id),
            received: Mutex::new(Vec::new()),
            accept_limit: None,
            closed: Mutex::new(None),
        })
    }

    pub(crate) fn accepting(id: &str, limit: usize) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::from(id),
            received: Mutex::new(Vec::new()),
            accept_limit: Some(limit),
            closed: Mutex::new(None),
        })
    }

    pub(crate) fn sequences(&self) -> Vec<u64> {
        self.received.lock().iter().map(|e| e.sequence_number).collect()
    }

    pub(crate) fn received(&self) -> Vec<EventEnvelope> {
        self.received.lock().clone()
    }

    pub(crate) fn closed_with(&self) -> Option<DetachReason> {
        *self.closed.lock()
    }
}

impl ConnectionSink for RecordingSink {
    fn connection_id(&self) -> &ConnectionId {
        &self.id
    }

    fn deliver(&self, envelope: &EventEnvelope) -> bool {
        let mut received = self.received.lock();
        if self.accept_limit.is_some_and(|limit| received.len() >= limit) {
            return false;
        }
        received.push(envelope.clone());
        true
    }

    fn close(&self, reason: DetachReason) {
        *self.closed.lock() = Some(reason);
    }
}
