//! Connection and server errors.

use conduit_core::ids::{ConnectionId, UserId};
use conduit_runtime::RuntimeError;

/// Errors raised while serving one connection's commands.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The connection already serves another user.
    #[error("connection {connection_id} serves user {bound}, not {requested}")]
    UserMismatch {
        /// Connection.
        connection_id: ConnectionId,
        /// User the connection is bound to.
        bound: UserId,
        /// User named by the command.
        requested: UserId,
    },

    /// The command needs an attached user.
    #[error("connection is not attached to a user")]
    NotAttached,

    /// The frame could not be parsed as a command.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// The user's session kept being reclaimed while attaching.
    #[error("session unavailable for user {0}")]
    SessionUnavailable(UserId),

    /// The runtime rejected the request.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl ConnectionError {
    /// Stable error code for `error` replies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UserMismatch { .. } => "user_mismatch",
            Self::NotAttached => "not_attached",
            Self::InvalidCommand(_) => "invalid_command",
            Self::SessionUnavailable(_) => "session_unavailable",
            Self::Runtime(err) => err.category(),
        }
    }
}

/// Errors raised while starting or running the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Other I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
