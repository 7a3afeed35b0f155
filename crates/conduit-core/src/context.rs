//! Immutable per-run execution context.
//!
//! An [`ExecutionContext`] is created once per run by a [`ContextBuilder`]
//! and never changes afterwards. Fields are private so no engine can rewrite
//! the identity it was constructed with.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::ids::{ConnectionId, RequestId, RunId, ThreadId, UserId};

/// A context field that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("execution context field `{field}` is empty")]
pub struct ContextError {
    /// Name of the offending field.
    pub field: &'static str,
}

/// Identity of one run, owned by exactly one execution engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExecutionContext {
    user_id: UserId,
    thread_id: ThreadId,
    run_id: RunId,
    request_id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    connection_id: Option<ConnectionId>,
    created_at: DateTime<Utc>,
}

impl ExecutionContext {
    /// Start building a context for `user_id` in `thread_id`.
    pub fn builder(user_id: UserId, thread_id: ThreadId) -> ContextBuilder {
        ContextBuilder {
            user_id,
            thread_id,
            run_id: None,
            request_id: None,
            connection_id: None,
        }
    }

    /// Owning user.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Conversation thread.
    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    /// Run this context belongs to.
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Request that started the run.
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Connection the run was started from, if any.
    pub fn connection_id(&self) -> Option<&ConnectionId> {
        self.connection_id.as_ref()
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Check that every identifier is non-empty.
    pub fn validate(&self) -> Result<(), ContextError> {
        let checks = [
            ("user_id", self.user_id.is_blank()),
            ("thread_id", self.thread_id.is_blank()),
            ("run_id", self.run_id.is_blank()),
            ("request_id", self.request_id.is_blank()),
        ];
        match checks.iter().find(|(_, blank)| *blank) {
            Some((field, _)) => Err(ContextError { field: *field }),
            None => match &self.connection_id {
                Some(id) if id.is_blank() => Err(ContextError {
                    field: "connection_id",
                }),
                _ => Ok(()),
            },
        }
    }
}

/// Consuming builder for [`ExecutionContext`]. Unset ids are generated.
#[derive(Debug)]
pub struct ContextBuilder {
    user_id: UserId,
    thread_id: ThreadId,
    run_id: Option<RunId>,
    request_id: Option<RequestId>,
    connection_id: Option<ConnectionId>,
}

impl ContextBuilder {
    /// Use a caller-supplied run id.
    #[must_use]
    pub fn run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Use a caller-supplied request id.
    #[must_use]
    pub fn request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Record the originating connection.
    #[must_use]
    pub fn connection_id(mut self, connection_id: ConnectionId) -> Self {
        self.connection_id = Some(connection_id);
        self
    }

    /// Finish the context. Validation is left to the engine factory.
    pub fn build(self) -> ExecutionContext {
        ExecutionContext {
            user_id: self.user_id,
            thread_id: self.thread_id,
            run_id: self.run_id.unwrap_or_else(RunId::generate),
            request_id: self.request_id.unwrap_or_else(RequestId::generate),
            connection_id: self.connection_id,
            created_at: Utc::now(),
        }
    }
}
