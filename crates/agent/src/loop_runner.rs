//! The bounded agent loop.
//!
//! An explicit state machine:
//!
//! ```text
//! AwaitingModel ──final answer──▶ Done
//!       │  ▲
//! tool  │  │ results appended in request order
//! calls ▼  │
//! ExecutingTools
//! ```
//!
//! Once the step counter passes `max_iterations` the loop stops in
//! `Aborted` and returns the best text it has. Tool failures and timeouts
//! are fed back to the model as data; only a failed model call or caller
//! cancellation ends the run with an error.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use contextloop_config::{ProviderSettings, ToolConfig};
use contextloop_core::agent::{AgentStep, AgentTrace, LoopState, ToolInvocation, TraceStatus};
use contextloop_core::error::{Error, ToolError};
use contextloop_core::message::{Message, MessageToolCall};
use contextloop_core::provider::{ModelReply, Provider, ProviderRequest, ToolDefinition};
use contextloop_core::tool::{Tool, ToolCall, ToolRegistry, ToolResult};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Returned when the loop is cut off before the model produced any text.
pub const ABORT_FALLBACK: &str = "I wasn't able to complete this request within the allowed number of steps. \
Please try rephrasing or narrowing the question.";

/// Final answer and audit trail of one loop run.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub final_answer: String,
    pub trace: AgentTrace,
}

/// Drives model calls and tool execution for a single request.
pub struct AgentLoop {
    /// The LLM provider to use
    provider: Arc<dyn Provider>,

    /// The model to use
    model: String,

    temperature: f32,

    /// Max tokens per model response
    max_tokens: Option<u32>,

    tools: Arc<ToolRegistry>,

    /// Maximum model/tool steps per run
    max_iterations: u32,

    tool_timeout: Duration,

    /// Empty means every registered tool.
    allowed_tools: Vec<String>,

    /// Tool outputs longer than this are cut.
    max_output_chars: usize,
}

impl AgentLoop {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            tools,
            max_iterations: 5,
            tool_timeout: Duration::from_secs(30),
            allowed_tools: Vec::new(),
            max_output_chars: 4000,
        }
    }

    /// A loop configured from the provider and per-request tool settings.
    /// With tools disabled, the model sees no tools at all.
    pub fn from_config(
        provider: Arc<dyn Provider>,
        settings: &ProviderSettings,
        tools: Arc<ToolRegistry>,
        config: &ToolConfig,
    ) -> Self {
        let tools = if config.enabled {
            tools
        } else {
            Arc::new(ToolRegistry::new())
        };
        Self::new(provider, settings.model.clone(), tools)
            .with_temperature(settings.temperature)
            .with_max_tokens(settings.max_tokens)
            .with_max_iterations(config.max_iterations)
            .with_tool_timeout(config.timeout())
            .with_allowed_tools(config.allowed.clone())
            .with_max_output_chars(config.max_output_chars)
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn with_allowed_tools(mut self, allowed: Vec<String>) -> Self {
        self.allowed_tools = allowed;
        self
    }

    pub fn with_max_output_chars(mut self, max: usize) -> Self {
        self.max_output_chars = max;
        self
    }

    fn is_allowed(&self, name: &str) -> bool {
        self.allowed_tools.is_empty() || self.allowed_tools.iter().any(|a| a == name)
    }

    fn resolve(&self, name: &str) -> Option<Arc<dyn Tool>> {
        if self.is_allowed(name) {
            self.tools.lookup(name)
        } else {
            None
        }
    }

    fn advertised_tools(&self) -> Vec<ToolDefinition> {
        self.tools
            .definitions()
            .into_iter()
            .filter(|d| self.is_allowed(&d.name))
            .collect()
    }

    /// Run the loop over `messages` (system prompt first, user message last).
    ///
    /// Cancelling `cancel` drops any in-flight model call or tool executions
    /// and returns [`Error::Cancelled`]. Results already recorded stay as they are.
    pub async fn run(&self, mut messages: Vec<Message>, cancel: &CancellationToken) -> Result<AgentOutcome, Error> {
        let tool_definitions = self.advertised_tools();
        let mut steps: Vec<AgentStep> = Vec::new();
        let mut seen_ids: HashSet<String> = HashSet::new();
        let mut step_number: u32 = 1;
        let mut reasoning: Option<String> = None;
        let mut best_text: Option<String> = None;
        let mut state = LoopState::AwaitingModel;

        loop {
            state = match state {
                LoopState::AwaitingModel if step_number > self.max_iterations => LoopState::Aborted,

                LoopState::AwaitingModel => {
                    debug!(step = step_number, messages = messages.len(), "Awaiting model");

                    let mut request = ProviderRequest::new(self.model.clone(), messages.clone())
                        .with_temperature(self.temperature)
                        .with_tools(tool_definitions.clone());
                    request.max_tokens = self.max_tokens;

                    let response = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        response = self.provider.complete(request) => response?,
                    };

                    match response.into_reply() {
                        ModelReply::Final(text) => {
                            steps.push(AgentStep {
                                step_number,
                                reasoning: None,
                                invocations: Vec::new(),
                            });
                            LoopState::Done(text)
                        }
                        ModelReply::ToolRequests { reasoning: text, calls } => {
                            let calls = assign_call_ids(calls, &mut seen_ids);
                            messages.push(assistant_with_calls(text.as_deref(), &calls));
                            if text.is_some() {
                                best_text.clone_from(&text);
                            }
                            reasoning = text;
                            LoopState::ExecutingTools(calls)
                        }
                    }
                }

                LoopState::ExecutingTools(calls) => {
                    debug!(step = step_number, tools = calls.len(), "Executing tools");

                    let results = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        results = self.execute_all(&calls) => results,
                    };

                    let mut invocations = Vec::with_capacity(calls.len());
                    for (call, result) in calls.into_iter().zip(results) {
                        messages.push(Message::tool_result(&call.call_id, result.content()));
                        invocations.push(ToolInvocation { call, result });
                    }

                    steps.push(AgentStep {
                        step_number,
                        reasoning: reasoning.take(),
                        invocations,
                    });
                    step_number += 1;
                    LoopState::AwaitingModel
                }

                LoopState::Done(final_answer) => {
                    info!(steps = steps.len(), "Agent loop finished");
                    return Ok(AgentOutcome {
                        final_answer,
                        trace: AgentTrace {
                            steps,
                            status: TraceStatus::Done,
                            abort_reason: None,
                        },
                    });
                }

                LoopState::Aborted => {
                    warn!(
                        steps = steps.len(),
                        max_iterations = self.max_iterations,
                        "Max iterations reached, aborting loop"
                    );
                    return Ok(AgentOutcome {
                        final_answer: best_text.unwrap_or_else(|| ABORT_FALLBACK.to_string()),
                        trace: AgentTrace {
                            steps,
                            status: TraceStatus::Aborted,
                            abort_reason: Some(format!(
                                "no final answer within {} steps",
                                self.max_iterations
                            )),
                        },
                    });
                }
            };
        }
    }

    /// Run every call of one step concurrently; results come back in request order.
    async fn execute_all(&self, calls: &[ToolCall]) -> Vec<ToolResult> {
        let pending = calls.iter().map(|call| async move {
            let result = match self.resolve(&call.tool_name) {
                Some(tool) => ToolRegistry::invoke(tool, call, self.tool_timeout).await,
                None => ToolResult::failed(call, ToolError::NotFound(call.tool_name.clone()).to_string()),
            };
            if !result.success {
                warn!(
                    tool = %call.tool_name,
                    call_id = %call.call_id,
                    error = result.error.as_deref().unwrap_or_default(),
                    "Tool call failed"
                );
            }
            self.truncate_output(result)
        });
        join_all(pending).await
    }

    fn truncate_output(&self, mut result: ToolResult) -> ToolResult {
        if let Some(output) = result.output.as_mut() {
            let total = output.chars().count();
            if total > self.max_output_chars {
                let mut cut: String = output.chars().take(self.max_output_chars).collect();
                cut.push_str(&format!("\n[output truncated: {} of {total} characters shown]", self.max_output_chars));
                *output = cut;
            }
        }
        result
    }
}

/// Replace empty or repeated call ids so every result maps to exactly one call.
fn assign_call_ids(calls: Vec<ToolCall>, seen: &mut HashSet<String>) -> Vec<ToolCall> {
    calls
        .into_iter()
        .map(|mut call| {
            if call.call_id.trim().is_empty() || seen.contains(&call.call_id) {
                call.call_id = format!("call_{}", uuid::Uuid::new_v4().simple());
            }
            seen.insert(call.call_id.clone());
            call
        })
        .collect()
}

/// The assistant turn that requested `calls`, with the ids the loop will answer to.
fn assistant_with_calls(reasoning: Option<&str>, calls: &[ToolCall]) -> Message {
    let mut message = Message::assistant(reasoning.unwrap_or_default());
    message.tool_calls = calls
        .iter()
        .map(|call| MessageToolCall {
            id: call.call_id.clone(),
            name: call.tool_name.clone(),
            arguments: match &call.args {
                serde_json::Value::String(raw) => raw.clone(),
                args => args.to_string(),
            },
        })
        .collect();
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{
        FailingProvider, RecordingProvider, SequentialMockProvider, make_text_response, make_tool_call,
        make_tool_call_response,
    };
    use async_trait::async_trait;
    use contextloop_core::message::Role;
    use contextloop_core::tool::ToolOutput;
    use serde_json::json;

    /// Sleeps for `delay_ms`, then returns `output`.
    struct SlowTool {
        name: &'static str,
        delay_ms: u64,
        output: &'static str,
    }

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "test tool"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }

        async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            Ok(ToolOutput::text(self.output))
        }
    }

    fn registry(tools: Vec<Arc<dyn Tool>>) -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool).unwrap();
        }
        Arc::new(registry)
    }

    fn slow(name: &'static str, delay_ms: u64, output: &'static str) -> Arc<dyn Tool> {
        Arc::new(SlowTool { name, delay_ms, output })
    }

    fn start() -> Vec<Message> {
        vec![Message::system("You are helpful."), Message::user("hi")]
    }

    #[tokio::test]
    async fn final_answer_in_one_step() {
        let provider = Arc::new(SequentialMockProvider::single_text("Hello!"));
        let agent = AgentLoop::new(provider.clone(), "mock-model", registry(vec![]));

        let outcome = agent.run(start(), &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.final_answer, "Hello!");
        assert_eq!(outcome.trace.status, TraceStatus::Done);
        assert_eq!(outcome.trace.steps.len(), 1);
        assert_eq!(outcome.trace.steps[0].step_number, 1);
        assert!(outcome.trace.steps[0].invocations.is_empty());
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn aborts_after_max_iterations() {
        let responses = (0..3)
            .map(|i| make_tool_call_response(vec![make_tool_call(&format!("c{i}"), "echo", json!({}))], ""))
            .collect();
        let provider = Arc::new(SequentialMockProvider::new(responses));
        let agent = AgentLoop::new(provider.clone(), "mock-model", registry(vec![slow("echo", 0, "ok")]))
            .with_max_iterations(3);

        let outcome = agent.run(start(), &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.trace.status, TraceStatus::Aborted);
        assert_eq!(outcome.trace.steps.len(), 3);
        assert_eq!(outcome.final_answer, ABORT_FALLBACK);
        assert!(outcome.trace.abort_reason.is_some());
        assert_eq!(provider.call_count(), 3);
        let numbers: Vec<u32> = outcome.trace.steps.iter().map(|s| s.step_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn abort_returns_last_reasoning() {
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(vec![make_tool_call("c1", "echo", json!({}))], "Looking it up."),
            make_tool_call_response(vec![make_tool_call("c2", "echo", json!({}))], "Almost there: 42."),
        ]));
        let agent = AgentLoop::new(provider, "mock-model", registry(vec![slow("echo", 0, "ok")]))
            .with_max_iterations(2);

        let outcome = agent.run(start(), &CancellationToken::new()).await.unwrap();
        assert!(outcome.trace.is_aborted());
        assert_eq!(outcome.final_answer, "Almost there: 42.");
        assert_eq!(outcome.trace.steps[0].reasoning.as_deref(), Some("Looking it up."));
    }

    #[tokio::test]
    async fn unknown_tool_is_fed_back() {
        let provider = Arc::new(RecordingProvider::new(vec![
            make_tool_call_response(vec![make_tool_call("c1", "foo", json!({}))], ""),
            make_text_response("I could not find that tool."),
        ]));
        let agent = AgentLoop::new(provider.clone(), "mock-model", registry(vec![]));

        let outcome = agent.run(start(), &CancellationToken::new()).await.unwrap();

        let result = &outcome.trace.steps[0].invocations[0].result;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("tool not found: foo"));
        assert_eq!(outcome.trace.status, TraceStatus::Done);

        let second = &provider.requests()[1];
        let fed_back = second.messages.last().unwrap();
        assert_eq!(fed_back.role, Role::Tool);
        assert_eq!(fed_back.tool_call_id.as_deref(), Some("c1"));
        assert_eq!(fed_back.content, "Error: tool not found: foo");
    }

    #[tokio::test(start_paused = true)]
    async fn results_keep_request_order() {
        let provider = Arc::new(RecordingProvider::new(vec![
            make_tool_call_response(
                vec![
                    make_tool_call("t1", "get_time", json!({})),
                    make_tool_call("t2", "calculator", json!({"expression": "1+1"})),
                ],
                "",
            ),
            make_text_response("done"),
        ]));
        // get_time finishes last
        let tools = registry(vec![slow("get_time", 500, "12:00"), slow("calculator", 10, "2")]);
        let agent = AgentLoop::new(provider.clone(), "mock-model", tools);

        let outcome = agent.run(start(), &CancellationToken::new()).await.unwrap();

        let names: Vec<&str> = outcome.trace.tool_results().map(|r| r.tool_name.as_str()).collect();
        assert_eq!(names, vec!["get_time", "calculator"]);

        let transcript = &provider.requests()[1].messages;
        let tool_messages: Vec<&str> = transcript
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(tool_messages, vec!["12:00", "2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn tools_in_one_step_run_concurrently() {
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(
                vec![make_tool_call("a", "slow_a", json!({})), make_tool_call("b", "slow_b", json!({}))],
                "",
            ),
            make_text_response("done"),
        ]));
        let tools = registry(vec![slow("slow_a", 1000, "a"), slow("slow_b", 1000, "b")]);
        let agent = AgentLoop::new(provider, "mock-model", tools);

        let started = tokio::time::Instant::now();
        agent.run(start(), &CancellationToken::new()).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_a_tool_failure() {
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(vec![make_tool_call("c1", "sleepy", json!({}))], ""),
            make_text_response("gave up on it"),
        ]));
        let agent = AgentLoop::new(provider, "mock-model", registry(vec![slow("sleepy", 60_000, "late")]))
            .with_tool_timeout(Duration::from_secs(1));

        let outcome = agent.run(start(), &CancellationToken::new()).await.unwrap();
        let result = &outcome.trace.steps[0].invocations[0].result;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("timed out"));
        assert_eq!(outcome.final_answer, "gave up on it");
    }

    #[tokio::test]
    async fn duplicate_and_empty_ids_are_replaced() {
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(
                vec![make_tool_call("same", "echo", json!({})), make_tool_call("same", "echo", json!({}))],
                "",
            ),
            make_tool_call_response(
                vec![make_tool_call("", "echo", json!({})), make_tool_call("same", "echo", json!({}))],
                "",
            ),
            make_text_response("done"),
        ]));
        let agent = AgentLoop::new(provider, "mock-model", registry(vec![slow("echo", 0, "ok")]));

        let outcome = agent.run(start(), &CancellationToken::new()).await.unwrap();

        let call_ids: Vec<&str> = outcome.trace.invocations().map(|i| i.call.call_id.as_str()).collect();
        let unique: HashSet<&str> = call_ids.iter().copied().collect();
        assert_eq!(call_ids.len(), 4);
        assert_eq!(unique.len(), 4);
        assert!(call_ids.iter().all(|id| !id.is_empty()));
        for invocation in outcome.trace.invocations() {
            assert_eq!(invocation.call.call_id, invocation.result.call_id);
        }
    }

    #[tokio::test]
    async fn disallowed_tool_is_hidden_and_not_found() {
        let provider = Arc::new(RecordingProvider::new(vec![
            make_tool_call_response(vec![make_tool_call("c1", "secret", json!({}))], ""),
            make_text_response("ok"),
        ]));
        let tools = registry(vec![slow("secret", 0, "classified"), slow("public", 0, "hello")]);
        let agent = AgentLoop::new(provider.clone(), "mock-model", tools)
            .with_allowed_tools(vec!["public".into()]);

        let outcome = agent.run(start(), &CancellationToken::new()).await.unwrap();

        let advertised: Vec<String> = provider.requests()[0].tools.iter().map(|t| t.name.clone()).collect();
        assert_eq!(advertised, vec!["public".to_string()]);
        let result = &outcome.trace.steps[0].invocations[0].result;
        assert_eq!(result.error.as_deref(), Some("tool not found: secret"));
    }

    #[tokio::test]
    async fn long_output_is_truncated() {
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(vec![make_tool_call("c1", "chatty", json!({}))], ""),
            make_text_response("done"),
        ]));
        let agent = AgentLoop::new(provider, "mock-model", registry(vec![slow("chatty", 0, "abcdefghij")]))
            .with_max_output_chars(4);

        let outcome = agent.run(start(), &CancellationToken::new()).await.unwrap();
        let output = outcome.trace.steps[0].invocations[0].result.output.clone().unwrap();
        assert!(output.starts_with("abcd\n[output truncated: 4 of 10"));
    }

    #[tokio::test]
    async fn model_failure_is_hard_error() {
        let agent = AgentLoop::new(Arc::new(FailingProvider), "mock-model", registry(vec![]));
        let err = agent.run(start(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_in_flight_tools() {
        let provider = Arc::new(SequentialMockProvider::new(vec![make_tool_call_response(
            vec![make_tool_call("c1", "sleepy", json!({}))],
            "",
        )]));
        let agent = AgentLoop::new(provider.clone(), "mock-model", registry(vec![slow("sleepy", 10_000, "late")]));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = agent.run(start(), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let provider = Arc::new(SequentialMockProvider::single_text("never"));
        let agent = AgentLoop::new(provider.clone(), "mock-model", registry(vec![]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(agent.run(start(), &cancel).await, Err(Error::Cancelled)));
        assert_eq!(provider.call_count(), 0);
    }

    #[test]
    fn from_config_disables_tools() {
        let config = ToolConfig {
            enabled: false,
            ..ToolConfig::default()
        };
        let agent = AgentLoop::from_config(
            Arc::new(SequentialMockProvider::new(vec![])),
            &ProviderSettings::default(),
            registry(vec![slow("echo", 0, "ok")]),
            &config,
        );
        assert!(agent.advertised_tools().is_empty());
        assert_eq!(agent.max_iterations, 5);
    }
}
