//! Callable tool capabilities and the read-only tool registry.
//!
//! Tools are named, schema-typed, asynchronous capabilities. Concrete
//! implementations live outside this crate; the runtime only needs their
//! name, their input schema, and a way to call them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Tool invocation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    /// No tool with this name is registered.
    #[error("tool not found: {0}")]
    NotFound(String),
    /// The calling stage did not declare this tool.
    #[error("stage `{stage}` is not permitted to call tool `{tool}`")]
    NotPermitted {
        /// Tool name.
        tool: String,
        /// Calling stage.
        stage: String,
    },
    /// Input did not match the tool's schema.
    #[error("invalid input for tool `{tool}`: {message}")]
    InvalidInput {
        /// Tool name.
        tool: String,
        /// What was wrong.
        message: String,
    },
    /// The tool ran and failed.
    #[error("tool `{tool}` failed: {message}")]
    Execution {
        /// Tool name.
        tool: String,
        /// Error description.
        message: String,
    },
}

/// A callable capability.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Registered name.
    fn name(&self) -> &str;

    /// JSON schema of the input object.
    fn input_schema(&self) -> Value;

    /// Invoke the tool. Implementations must be safe for concurrent use.
    async fn call(&self, input: Value) -> Result<Value, ToolError>;
}

/// Tool access as seen by a running stage.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Validate `input` and call the named tool.
    async fn invoke(&self, tool: &str, input: Value) -> Result<Value, ToolError>;
}

/// Check the `required` keys of an object schema against `input`.
pub fn check_required(tool: &str, schema: &Value, input: &Value) -> Result<(), ToolError> {
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Ok(());
    };
    let Some(fields) = input.as_object() else {
        return Err(ToolError::InvalidInput {
            tool: tool.to_owned(),
            message: "input must be an object".into(),
        });
    };
    for key in required.iter().filter_map(Value::as_str) {
        if !fields.contains_key(key) {
            return Err(ToolError::InvalidInput {
                tool: tool.to_owned(),
                message: format!("missing required field `{key}`"),
            });
        }
    }
    Ok(())
}

/// Name-indexed tool set. Populated at startup, then shared read-only.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any previous tool of the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        debug!(tool = tool.name(), "tool registered");
        let _ = self.tools.insert(tool.name().to_owned(), tool);
    }

    /// Look up a tool.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Whether a tool is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Sorted tool names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
