//! Tool system: trait-based tools invoked through the capability registry.
//!
//! Each tool implements the [`Tool`] trait and is registered as a tagged
//! entry in a [`CapabilityTable`](super::capability::CapabilityTable).
//! Tool failures are classified as transient (retried by the executor) or
//! permanent (never retried).

use std::collections::HashMap;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by tool invocation.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum ToolError {
    #[error("tool \"{tool_name}\" failed transiently: {message}")]
    #[diagnostic(
        code(evo::tool::transient),
        help("The executor retries transient failures with exponential backoff.")
    )]
    Transient { tool_name: String, message: String },

    #[error("tool \"{tool_name}\" failed permanently: {message}")]
    #[diagnostic(
        code(evo::tool::permanent),
        help("Permanent failures are not retried. Check the tool's arguments and preconditions.")
    )]
    Permanent { tool_name: String, message: String },

    #[error("invalid arguments for \"{tool_name}\": {message}")]
    #[diagnostic(
        code(evo::tool::invalid_arguments),
        help("Compare the invocation arguments against the tool's signature.")
    )]
    InvalidArguments { tool_name: String, message: String },

    #[error("tool not found: \"{name}\"")]
    #[diagnostic(
        code(evo::tool::not_found),
        help("Register the tool in the capability registry before planning with it.")
    )]
    NotFound { name: String },
}

impl ToolError {
    /// Whether the executor may retry this failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Convenience alias for tool operations.
pub type ToolResult<T> = std::result::Result<T, ToolError>;

/// Description of a tool's interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSignature {
    /// Unique name of the tool.
    pub name: String,
    /// What this tool does.
    pub description: String,
    /// Parameters the tool accepts.
    pub parameters: Vec<ToolParam>,
}

/// A single parameter in a tool's signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    pub description: String,
    pub required: bool,
}

/// Named string arguments passed to a tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolInput {
    pub params: HashMap<String, String>,
}

impl ToolInput {
    /// Create a new empty input.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Get a parameter value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(|s| s.as_str())
    }

    /// Get a required parameter, failing permanently if it is missing.
    pub fn require(&self, name: &str, tool_name: &str) -> ToolResult<&str> {
        self.get(name).ok_or_else(|| ToolError::InvalidArguments {
            tool_name: tool_name.into(),
            message: format!("missing required parameter: {name}"),
        })
    }
}

/// Output from a successful tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Human-readable result summary.
    pub result: String,
}

impl ToolOutput {
    pub fn ok(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
        }
    }
}

/// A tool the agent can execute.
pub trait Tool: Send + Sync {
    /// Describe this tool's interface.
    fn signature(&self) -> ToolSignature;

    /// Execute the tool with the given input.
    fn execute(&self, input: &ToolInput) -> ToolResult<ToolOutput>;
}

/// Check a tool name: non-empty, ASCII alphanumerics and underscores only.
pub fn is_valid_tool_name(name: &str) -> bool {
    !name.trim().is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
