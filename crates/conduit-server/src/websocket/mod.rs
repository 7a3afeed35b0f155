//! WebSocket connections: protocol, heartbeat, command handling, and the
//! connection manager that ties transports to user sessions.

pub mod connection;
pub mod handler;
pub mod heartbeat;
pub mod manager;
pub mod protocol;
pub mod session;
