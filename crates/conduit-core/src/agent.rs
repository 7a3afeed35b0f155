//! The capability interface every pipeline stage implements.
//!
//! An agent receives the run's [`ExecutionContext`] by reference for the
//! duration of one call and must not retain it. Everything else it may touch
//! arrives through [`StageInput`]: the request body, outputs of completed
//! upstream stages, a stage-scoped tool invoker, and a progress reporter.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::context::ExecutionContext;
use crate::stage::StageKind;
use crate::tools::{ToolError, ToolInvoker};

/// Why a stage did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// The agent reported a failure.
    #[error("{0}")]
    Failed(String),
    /// A tool call failed and the agent propagated it.
    #[error(transparent)]
    Tool(#[from] ToolError),
    /// The stage exceeded its time budget.
    #[error("stage timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    /// The run was cancelled while the stage was pending or running.
    #[error("run cancelled")]
    Cancelled,
    /// The agent panicked.
    #[error("stage panicked: {0}")]
    Panicked(String),
    /// A predecessor failed, so this stage never ran.
    #[error("upstream stage `{0}` failed")]
    UpstreamFailed(String),
    /// The system is shedding load.
    #[error("load shed: {0}")]
    LoadShed(String),
}

impl StageError {
    /// Stable code for event payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Failed(_) => "failed",
            Self::Tool(_) => "tool",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Panicked(_) => "panicked",
            Self::UpstreamFailed(_) => "upstream_failed",
            Self::LoadShed(_) => "load_shed",
        }
    }

    /// Whether the stage was skipped rather than attempted.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::UpstreamFailed(_) | Self::LoadShed(_))
    }
}

/// Progress hooks available to a running stage.
pub trait ProgressReporter: Send + Sync {
    /// Report intermediate reasoning.
    fn thinking(&self, message: &str);

    /// Stream a partial result.
    fn partial(&self, data: Value);
}

/// Everything a stage receives besides the context.
pub struct StageInput<'a> {
    /// The run's request body.
    pub request: &'a Value,
    /// Outputs of completed stages, keyed by agent name.
    pub upstream: &'a BTreeMap<String, Value>,
    /// Tool access restricted to the stage's declared tools.
    pub tools: &'a dyn ToolInvoker,
    /// Progress event hooks.
    pub progress: &'a dyn ProgressReporter,
}

/// A pipeline stage.
#[async_trait]
pub trait AgentContract: Send + Sync {
    /// Unique agent name.
    fn name(&self) -> &str;

    /// Stage category. Fixes the ordering tier.
    fn stage_kind(&self) -> StageKind;

    /// Names of stages this one waits for, in addition to every lower tier.
    fn depends_on(&self) -> Vec<String> {
        Vec::new()
    }

    /// Tools this stage may call.
    fn required_tools(&self) -> Vec<String> {
        Vec::new()
    }

    /// Run the stage.
    async fn execute(
        &self,
        context: &ExecutionContext,
        input: StageInput<'_>,
    ) -> Result<Value, StageError>;
}

/// Name-indexed agent set. Populated at startup, then shared read-only.
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn AgentContract>>,
}

impl AgentRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent, replacing any previous agent of the same name.
    pub fn register(&mut self, agent: Arc<dyn AgentContract>) {
        debug!(agent = agent.name(), kind = %agent.stage_kind(), "agent registered");
        let _ = self.agents.insert(agent.name().to_owned(), agent);
    }

    /// Look up an agent.
    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentContract>> {
        self.agents.get(name).cloned()
    }

    /// Sorted agent names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of agents.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
