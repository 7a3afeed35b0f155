//! # conduit-runtime
//!
//! Per-user multi-agent execution.
//!
//! - [`registry::SessionRegistry`] maps users to [`session::UserSession`]s and
//!   claims run ids registry-wide.
//! - [`engine::ExecutionEngineFactory`] builds one isolated engine per run.
//! - [`workflow::WorkflowOrchestrator`] drives stages in tier and dependency
//!   order, containing every stage failure.
//! - [`bridge::EventBridge`] numbers lifecycle events per run and hands them
//!   to the connection layer over one channel.
//! - [`lifecycle::LifecycleManager`] reclaims idle sessions.
//! - [`fallback`] builds degraded responses and detects cascades.
//! - [`runtime::Runtime`] wires it all together.

#![deny(unsafe_code)]

pub mod archive;
pub mod bridge;
pub mod dispatcher;
pub mod engine;
pub mod errors;
pub mod fallback;
pub mod lifecycle;
pub mod plan;
pub mod record;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod workflow;

#[cfg(test)]
mod testing;

pub use errors::RuntimeError;
pub use runtime::{Runtime, RuntimeConfig, RuntimeDeps, RunStarted, StartRun};
