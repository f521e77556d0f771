//! Tool trait and the Tool Registry.
//!
//! Tools are registered once at startup. The registry is then shared behind an
//! `Arc` and never mutated, so lookups during request processing take no lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::ToolError;
use crate::provider::ToolDefinition;

/// A request from the model to execute a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the LLM's tool_call.id)
    pub call_id: String,

    pub tool_name: String,

    /// Arguments as a JSON value
    pub args: serde_json::Value,

    pub timestamp: DateTime<Utc>,
}

impl ToolCall {
    pub fn new(call_id: impl Into<String>, tool_name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            args,
            timestamp: Utc::now(),
        }
    }
}

/// The outcome of one tool call. Failures are data, never errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result is for
    pub call_id: String,

    pub tool_name: String,

    pub success: bool,

    /// Output content on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    /// Error description on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Optional structured data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    pub timestamp: DateTime<Utc>,
}

impl ToolResult {
    pub fn ok(call: &ToolCall, output: ToolOutput) -> Self {
        Self {
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            success: true,
            output: Some(output.content),
            error: None,
            data: output.data,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(call: &ToolCall, error: impl Into<String>) -> Self {
        Self {
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            success: false,
            output: None,
            error: Some(error.into()),
            data: None,
            timestamp: Utc::now(),
        }
    }

    /// The text fed back to the model: the output, or `Error: ...`.
    pub fn content(&self) -> String {
        match (&self.output, &self.error) {
            (Some(output), _) if self.success => output.clone(),
            (_, Some(error)) => format!("Error: {error}"),
            _ => String::new(),
        }
    }
}

/// What a tool returns on success.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub data: Option<serde_json::Value>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// The core Tool trait.
///
/// Each tool implements this trait. Tools are registered in the
/// [`ToolRegistry`] and made available to the agent loop.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "calculator").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: serde_json::Value) -> std::result::Result<ToolOutput, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of available tools.
///
/// The agent loop uses this to:
/// 1. Get tool definitions to send to the LLM
/// 2. Look up and invoke tools when the LLM requests them
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Names must be unique.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> std::result::Result<(), ToolError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(ToolError::Duplicate(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Look up a tool by name.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Run a resolved tool under a timeout. A timeout or tool error comes
    /// back as an unsuccessful [`ToolResult`].
    pub async fn invoke(tool: Arc<dyn Tool>, call: &ToolCall, timeout: Duration) -> ToolResult {
        debug!(tool = %call.tool_name, call_id = %call.call_id, "Invoking tool");
        match tokio::time::timeout(timeout, tool.execute(call.args.clone())).await {
            Ok(Ok(output)) => ToolResult::ok(call, output),
            Ok(Err(e)) => ToolResult::failed(call, e.to_string()),
            Err(_) => ToolResult::failed(
                call,
                ToolError::Timeout {
                    tool_name: call.tool_name.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                }
                .to_string(),
            ),
        }
    }

    /// Look up and invoke in one go; unknown names yield `tool not found: NAME`.
    pub async fn execute(&self, call: &ToolCall, timeout: Duration) -> ToolResult {
        match self.lookup(&call.tool_name) {
            Some(tool) => Self::invoke(tool, call, timeout).await,
            None => ToolResult::failed(call, ToolError::NotFound(call.tool_name.clone()).to_string()),
        }
    }

    /// All tool definitions, sorted by name so requests are reproducible.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// List all registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
