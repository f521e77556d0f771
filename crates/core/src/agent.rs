//! Agent trace types: what happened during one bounded tool-calling loop.

use serde::{Deserialize, Serialize};

use crate::tool::{ToolCall, ToolResult};

/// States of the agent loop.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopState {
    AwaitingModel,
    ExecutingTools(Vec<ToolCall>),
    Done(String),
    Aborted,
}

/// How the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraceStatus {
    Done,
    Aborted,
}

/// One tool call paired with its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub call: ToolCall,
    pub result: ToolResult,
}

/// One loop iteration: a model decision plus any tool executions it asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStep {
    /// Starts at 1, strictly increasing.
    pub step_number: u32,

    /// Text the model produced alongside its decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    /// Tool invocations in the order the model requested them. Empty for a
    /// final-answer step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invocations: Vec<ToolInvocation>,
}

/// Ordered audit trail of a loop run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTrace {
    pub steps: Vec<AgentStep>,
    pub status: TraceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
}

impl AgentTrace {
    pub fn is_aborted(&self) -> bool {
        self.status == TraceStatus::Aborted
    }

    /// All tool results of the run, in step and request order.
    pub fn tool_results(&self) -> impl Iterator<Item = &ToolResult> {
        self.steps
            .iter()
            .flat_map(|s| s.invocations.iter().map(|i| &i.result))
    }

    /// All tool invocations of the run, in step and request order.
    pub fn invocations(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.steps.iter().flat_map(|s| s.invocations.iter())
    }
}
