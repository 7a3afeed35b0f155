//! # conduit-server
//!
//! WebSocket and HTTP surface of the Conduit runtime.
//!
//! - [`websocket::manager::ConnectionManager`] binds connections to user
//!   sessions, replays buffered events on reconnect, and dispatches the
//!   runtime's event stream
//! - Heartbeat pings evict unresponsive connections without cancelling runs
//! - HTTP endpoints: `/health`, `/metrics`, `/sessions`, `/ws`
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod server;
pub mod shutdown;
pub mod websocket;

#[cfg(test)]
mod testing;

pub use config::ServerConfig;
pub use errors::{ConnectionError, ServerError};
pub use server::{ConduitServer, ServerHandle};
