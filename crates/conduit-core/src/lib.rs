//! # conduit-core
//!
//! Shared vocabulary for the Conduit runtime.
//!
//! - **Branded IDs**: `UserId`, `ThreadId`, `RunId`, `RequestId`, `ConnectionId`
//! - **Execution context**: immutable per-run identity carried by every engine
//! - **Stage model**: `StageKind` tiers, `AgentStatus` transitions, `AgentInstance`
//! - **Events**: `EventType` and the sequence-numbered `EventEnvelope`
//! - **Contracts**: `AgentContract` for pipeline stages, `Tool` for callable capabilities

#![deny(unsafe_code)]

pub mod agent;
pub mod context;
pub mod events;
pub mod ids;
pub mod stage;
pub mod tools;
