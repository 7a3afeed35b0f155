//! Wire protocol: inbound commands and the direct replies to them.
//!
//! Both directions are JSON objects tagged by `type`. Run events are sent as
//! bare [`EventEnvelope`](conduit_core::events::EventEnvelope)s and never as
//! replies.

use conduit_core::ids::{ConnectionId, RunId, ThreadId, UserId};
use conduit_runtime::engine::RunRequest;
use conduit_runtime::session::ReplayCursor;
use serde::{Deserialize, Serialize};

use crate::errors::ConnectionError;

/// Client to server.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Start a run. Attaches the connection first if needed.
    StartRun {
        /// Requesting user.
        user_id: UserId,
        /// Conversation thread.
        thread_id: ThreadId,
        /// Stages and input.
        request: RunRequest,
        /// Client-chosen run id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<RunId>,
    },
    /// Bind the connection to a user and replay buffered events.
    Attach {
        /// User to attach to.
        user_id: UserId,
        /// Highest sequence already received.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seen_sequence: Option<u64>,
        /// Run the sequence refers to; defaults to the latest run.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<RunId>,
    },
    /// Cancel one of the attached user's runs.
    CancelRun {
        /// Run to cancel.
        run_id: RunId,
    },
    /// Acknowledge events up to `sequence`, releasing their replay buffer.
    Ack {
        /// Run.
        run_id: RunId,
        /// Highest processed sequence.
        sequence: u64,
    },
    /// Application-level keepalive.
    Ping,
}

impl ClientCommand {
    /// Parse one text frame.
    pub fn parse(text: &str) -> Result<Self, ConnectionError> {
        serde_json::from_str(text).map_err(|err| ConnectionError::InvalidCommand(err.to_string()))
    }

    /// Wire name, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartRun { .. } => "start_run",
            Self::Attach { .. } => "attach",
            Self::CancelRun { .. } => "cancel_run",
            Self::Ack { .. } => "ack",
            Self::Ping => "ping",
        }
    }
}

/// Replay position requested by an `attach`, if any.
pub fn replay_cursor(last_seen_sequence: Option<u64>, run_id: Option<RunId>) -> Option<ReplayCursor> {
    if last_seen_sequence.is_none() && run_id.is_none() {
        return None;
    }
    Some(ReplayCursor {
        run_id,
        last_seen_sequence: last_seen_sequence.unwrap_or_default(),
    })
}

/// Server to client, in response to a command.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerReply {
    /// The run was accepted.
    RunStarted {
        /// Run id.
        run_id: RunId,
        /// Thread id.
        thread_id: ThreadId,
        /// Stage names in plan order.
        stages: Vec<String>,
    },
    /// The connection is attached; buffered events were replayed before this
    /// reply.
    Attached {
        /// User.
        user_id: UserId,
        /// Envelopes replayed.
        replayed: usize,
        /// Connection displaced by this one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replaced: Option<ConnectionId>,
    },
    /// Cancellation outcome. `cancelled` is `false` if already requested.
    RunCancelled {
        /// Run id.
        run_id: RunId,
        /// Whether this request cancelled it.
        cancelled: bool,
    },
    /// Acknowledgement applied.
    Acked {
        /// Run id.
        run_id: RunId,
        /// Acknowledged sequence.
        sequence: u64,
    },
    /// Keepalive answer.
    Pong,
    /// The command failed.
    Error {
        /// Stable error code.
        code: String,
        /// Human-readable message.
        message: String,
    },
}

impl From<&ConnectionError> for ServerReply {
    fn from(err: &ConnectionError) -> Self {
        Self::Error {
            code: err.code().to_owned(),
            message: err.to_string(),
        }
    }
}
