//! Runtime error taxonomy.

use conduit_core::agent::StageError;
use conduit_core::context::ContextError;
use conduit_core::ids::{RunId, UserId};

/// Errors raised by the runtime.
///
/// Only precondition failures ([`RuntimeError::is_precondition`]) ever reach
/// the caller of `start_run`. Stage failures are captured by the
/// orchestrator and turned into `failed` stages and a terminal `run_failed`
/// event.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The run id is already claimed by an active engine.
    #[error("run already exists: {0}")]
    DuplicateRun(RunId),

    /// A required capability could not be wired into the engine.
    #[error("engine construction failed for run {run_id}: {reason}")]
    EngineConstruction {
        /// Run being constructed.
        run_id: RunId,
        /// What was missing or inconsistent.
        reason: String,
    },

    /// A stage failed. Never escapes the orchestrator.
    #[error("stage `{agent}` failed: {source}")]
    StageExecution {
        /// Failing agent.
        agent: String,
        /// Underlying stage error.
        #[source]
        source: StageError,
    },

    /// The user's connection went away. Events keep buffering.
    #[error("connection lost for user {0}")]
    ConnectionLost(UserId),

    /// Correlated failures across runs crossed the configured threshold.
    #[error("cascade threshold exceeded: {failures} failures across {runs} runs")]
    CascadeThresholdExceeded {
        /// Failures inside the window.
        failures: usize,
        /// Distinct runs those failures span.
        runs: usize,
    },

    /// The execution context is malformed.
    #[error("invalid execution context: {0}")]
    InvalidContext(#[from] ContextError),

    /// No active run with this id (or not owned by the caller).
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    /// No session for this user.
    #[error("session not found: {0}")]
    SessionNotFound(UserId),
}

impl RuntimeError {
    /// Whether the error is a caller precondition violation.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::DuplicateRun(_)
                | Self::EngineConstruction { .. }
                | Self::InvalidContext(_)
                | Self::RunNotFound(_)
                | Self::SessionNotFound(_)
        )
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost(_) | Self::CascadeThresholdExceeded { .. }
        )
    }

    /// Stable error code for wire replies and logs.
    pub fn category(&self) -> &'static str {
        match self {
            Self::DuplicateRun(_) => "duplicate_run",
            Self::EngineConstruction { .. } => "engine_construction",
            Self::StageExecution { .. } => "stage_execution",
            Self::ConnectionLost(_) => "connection_lost",
            Self::CascadeThresholdExceeded { .. } => "cascade_threshold_exceeded",
            Self::InvalidContext(_) => "invalid_context",
            Self::RunNotFound(_) => "run_not_found",
            Self::SessionNotFound(_) => "session_not_found",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let err = RuntimeError::EngineConstruction {
            run_id: RunId::from("r1"),
            reason: "unknown stage `x`".into(),
        };
        assert_eq!(
            err.to_string(),
            "engine construction failed for run r1: unknown stage `x`"
        );
        let err = RuntimeError::CascadeThresholdExceeded { failures: 7, runs: 3 };
        assert_eq!(
            err.to_string(),
            "cascade threshold exceeded: 7 failures across 3 runs"
        );
    }

    #[test]
    fn stage_execution_keeps_source() {
        let err = RuntimeError::StageExecution {
            agent: "usage".into(),
            source: StageError::Failed("quota".into()),
        };
        assert_eq!(err.to_string(), "stage `usage` failed: quota");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn classification() {
        assert!(RuntimeError::DuplicateRun(RunId::from("r")).is_precondition());
        assert!(RuntimeError::InvalidContext(ContextError { field: "user_id" }).is_precondition());
        assert!(!RuntimeError::ConnectionLost(UserId::from("u")).is_precondition());
        assert!(RuntimeError::ConnectionLost(UserId::from("u")).is_recoverable());
        assert!(!RuntimeError::RunNotFound(RunId::from("r")).is_recoverable());
    }

    #[test]
    fn categories_are_distinct() {
        let errors = [
            RuntimeError::DuplicateRun(RunId::from("r")),
            RuntimeError::EngineConstruction {
                run_id: RunId::from("r"),
                reason: String::new(),
            },
            RuntimeError::StageExecution {
                agent: String::new(),
                source: StageError::Cancelled,
            },
            RuntimeError::ConnectionLost(UserId::from("u")),
            RuntimeError::CascadeThresholdExceeded { failures: 0, runs: 0 },
            RuntimeError::InvalidContext(ContextError { field: "run_id" }),
            RuntimeError::RunNotFound(RunId::from("r")),
            RuntimeError::SessionNotFound(UserId::from("u")),
        ];
        let mut codes: Vec<&str> = errors.iter().map(RuntimeError::category).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
