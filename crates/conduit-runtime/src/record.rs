//! Per-run record of stage instances and run status.
//!
//! The record is the authority on the stage-order invariant: a stage may
//! only enter `running` when every stage of a strictly lower tier in the
//! same run has `completed`.

use chrono::{DateTime, Utc};
use conduit_core::context::ExecutionContext;
use conduit_core::ids::{RunId, ThreadId, UserId};
use conduit_core::stage::{AgentInstance, AgentStatus, TransitionError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Terminal or in-progress state of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Stages are still executing.
    Running,
    /// Every stage completed.
    Completed,
    /// At least one stage failed.
    Failed,
    /// Cancelled by the user or by reclamation.
    Cancelled,
}

impl RunStatus {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the run is over.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Rejected record mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    /// A lower-tier stage has not completed yet.
    #[error("stage `{stage}` cannot start while `{blocking}` is {status}")]
    StageOrderViolation {
        /// Stage that tried to start.
        stage: String,
        /// Lower-tier stage that is not completed.
        blocking: String,
        /// Its current status.
        status: &'static str,
    },
    /// Index outside the record.
    #[error("no stage at index {0}")]
    UnknownStage(usize),
    /// Illegal status change.
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Ordered stage instances of one run plus its status.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run id.
    pub run_id: RunId,
    /// Owning user.
    pub user_id: UserId,
    /// Thread the run belongs to.
    pub thread_id: ThreadId,
    /// Stage instances in plan order.
    pub agents: Vec<AgentInstance>,
    /// Run status.
    pub status: RunStatus,
    /// Creation time.
    pub started_at: DateTime<Utc>,
    /// Time the run reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Fallback payload attached to a failed or cancelled run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Value>,
}

impl RunRecord {
    /// A running record with every stage pending.
    pub fn new(context: &ExecutionContext, agents: Vec<AgentInstance>) -> Self {
        Self {
            run_id: context.run_id().clone(),
            user_id: context.user_id().clone(),
            thread_id: context.thread_id().clone(),
            agents,
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            fallback: None,
        }
    }

    /// Move a stage to `running`, enforcing tier order.
    pub fn start_stage(&mut self, index: usize) -> Result<(), RecordError> {
        let tier = self
            .agents
            .get(index)
            .ok_or(RecordError::UnknownStage(index))?
            .stage_kind
            .tier();
        if let Some(blocking) = self
            .agents
            .iter()
            .find(|a| a.stage_kind.tier() < tier && a.status != AgentStatus::Completed)
        {
            return Err(RecordError::StageOrderViolation {
                stage: self.agents[index].name.clone(),
                blocking: blocking.name.clone(),
                status: blocking.status.as_str(),
            });
        }
        self.agents[index].start()?;
        Ok(())
    }

    /// Move a running stage to `completed`.
    pub fn complete_stage(&mut self, index: usize) -> Result<(), RecordError> {
        self.agent_mut(index)?.complete()?;
        Ok(())
    }

    /// Move a pending or running stage to `failed`.
    pub fn fail_stage(&mut self, index: usize, error: &str) -> Result<(), RecordError> {
        self.agent_mut(index)?.fail(error)?;
        Ok(())
    }

    fn agent_mut(&mut self, index: usize) -> Result<&mut AgentInstance, RecordError> {
        self.agents
            .get_mut(index)
            .ok_or(RecordError::UnknownStage(index))
    }

    /// Status of one stage.
    pub fn status_of(&self, index: usize) -> Option<AgentStatus> {
        self.agents.get(index).map(|a| a.status)
    }

    /// Indices of stages in the given status.
    pub fn indices_with(&self, status: AgentStatus) -> Vec<usize> {
        self.agents
            .iter()
            .enumerate()
            .filter(|(_, a)| a.status == status)
            .map(|(i, _)| i)
            .collect()
    }

    /// Stages that ended failed.
    pub fn failed_agents(&self) -> impl Iterator<Item = &AgentInstance> {
        self.agents.iter().filter(|a| a.status == AgentStatus::Failed)
    }

    /// Set the terminal status. A record that is already terminal is left alone.
    pub fn finish(&mut self, status: RunStatus, fallback: Option<Value>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.fallback = fallback;
    }

    /// Rough in-memory size for footprint accounting.
    pub fn approx_size(&self) -> usize {
        let agents: usize = self
            .agents
            .iter()
            .map(|a| 96 + a.name.len() + a.error.as_ref().map_or(0, String::len))
            .sum();
        128 + self.run_id.len() + self.user_id.len() + self.thread_id.len() + agents
    }
}
