//! Per-run tool access. Each stage gets a view restricted to the tools it
//! declared, and every call is announced with a `tool_executing` event.

use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::events::EventType;
use conduit_core::stage::StageKind;
use conduit_core::tools::{check_required, ToolError, ToolInvoker, ToolRegistry};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::bridge::RunEmitter;

/// Tool dispatcher owned by one engine.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    emitter: RunEmitter,
}

impl ToolDispatcher {
    /// Dispatcher over the shared read-only registry.
    pub fn new(registry: Arc<ToolRegistry>, emitter: RunEmitter) -> Self {
        Self { registry, emitter }
    }

    /// View for one stage, limited to `allowed`.
    pub fn for_stage(&self, name: &str, kind: StageKind, allowed: Vec<String>) -> StageTools {
        StageTools {
            registry: Arc::clone(&self.registry),
            emitter: self.emitter.clone(),
            stage: name.to_owned(),
            kind,
            allowed,
        }
    }
}

/// Tool invoker handed to a running stage.
pub struct StageTools {
    registry: Arc<ToolRegistry>,
    emitter: RunEmitter,
    stage: String,
    kind: StageKind,
    allowed: Vec<String>,
}

#[async_trait]
impl ToolInvoker for StageTools {
    #[instrument(skip(self, input), fields(stage = %self.stage, run_id = %self.emitter.run_id()))]
    async fn invoke(&self, tool: &str, input: Value) -> Result<Value, ToolError> {
        if !self.allowed.iter().any(|t| t == tool) {
            return Err(ToolError::NotPermitted {
                tool: tool.to_owned(),
                stage: self.stage.clone(),
            });
        }
        let handler = self
            .registry
            .get(tool)
            .ok_or_else(|| ToolError::NotFound(tool.to_owned()))?;
        check_required(tool, &handler.input_schema(), &input)?;

        if let Err(err) = self.emitter.emit_stage(
            EventType::ToolExecuting,
            &self.stage,
            self.kind,
            json!({ "tool": tool, "input": input }),
        ) {
            debug!(%err, "tool_executing event dropped");
        }
        handler.call(input).await
    }
}
