//! Stage kinds, agent status transitions, and per-stage instances.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category of a pipeline stage. Determines its ordering tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Classifies the request before any data is gathered.
    Triage,
    /// Gathers data. Every data stage completes before tier 2 starts.
    Data,
    /// Produces recommendations from gathered data.
    Optimization,
    /// Summarizes results for the user.
    Reporting,
    /// Performs follow-up actions.
    Action,
}

impl StageKind {
    /// Ordering tier: triage 0, data 1, everything downstream 2.
    pub fn tier(self) -> u8 {
        match self {
            Self::Triage => 0,
            Self::Data => 1,
            Self::Optimization | Self::Reporting | Self::Action => 2,
        }
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Triage => "triage",
            Self::Data => "data",
            Self::Optimization => "optimization",
            Self::Reporting => "reporting",
            Self::Action => "action",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "triage" => Ok(Self::Triage),
            "data" => Ok(Self::Data),
            "optimization" => Ok(Self::Optimization),
            "reporting" => Ok(Self::Reporting),
            "action" => Ok(Self::Action),
            other => Err(format!("unknown stage kind: {other}")),
        }
    }
}

/// Lifecycle of one agent instance within a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Waiting for predecessors.
    Pending,
    /// Executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed, short-circuited, or cancelled.
    Failed,
}

impl AgentStatus {
    /// Whether no further transition is allowed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Allowed moves: `pending -> running`, `pending -> failed`,
    /// `running -> completed`, `running -> failed`.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Failed)
                | (Self::Running, Self::Completed | Self::Failed)
        )
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Rejected status change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("agent `{agent}` cannot move from {from:?} to {to:?}")]
pub struct TransitionError {
    /// Agent name.
    pub agent: String,
    /// Current status.
    pub from: AgentStatus,
    /// Requested status.
    pub to: AgentStatus,
}

/// One stage of one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentInstance {
    /// Agent name as registered.
    pub name: String,
    /// Stage category.
    pub stage_kind: StageKind,
    /// Current status.
    pub status: AgentStatus,
    /// When the stage entered `running`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the stage reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentInstance {
    /// A pending instance.
    pub fn new(name: impl Into<String>, stage_kind: StageKind) -> Self {
        Self {
            name: name.into(),
            stage_kind,
            status: AgentStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Enter `running`.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(AgentStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Enter `completed`.
    pub fn complete(&mut self) -> Result<(), TransitionError> {
        self.transition(AgentStatus::Completed)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Enter `failed` with an error detail.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(AgentStatus::Failed)?;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
        Ok(())
    }

    fn transition(&mut self, next: AgentStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                agent: self.name.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}
