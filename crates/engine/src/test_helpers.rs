//! Shared mocks for engine tests: a scripted provider, scripted tools,
//! and canned confirmation gates.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskloom_core::error::{ProviderError, ToolError};
use taskloom_core::message::{Message, MessageToolCall};
use taskloom_core::provider::{CompletionRequest, CompletionResponse, Provider, Usage};
use taskloom_core::tool::{ConfirmationGate, ConfirmationRequest, Tool, ToolResult};

/// A provider that replays a script of responses in order and records
/// every request it sees. Panics when the script runs dry — a test that
/// over-calls the provider is broken.
pub struct SequentialMockProvider {
    responses: Mutex<VecDeque<Result<CompletionResponse, ProviderError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl SequentialMockProvider {
    pub fn new(responses: Vec<CompletionResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Ok).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn from_results(results: Vec<Result<CompletionResponse, ProviderError>>) -> Self {
        Self {
            responses: Mutex::new(results.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every request the engine issued, in order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for SequentialMockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        self.requests.lock().unwrap().push(request);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .expect("SequentialMockProvider ran out of scripted responses")
    }
}

pub fn make_text_response(text: &str) -> CompletionResponse {
    CompletionResponse {
        message: Message::assistant(text),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock-model".into(),
    }
}

pub fn make_tool_call(id: &str, name: &str, arguments: serde_json::Value) -> MessageToolCall {
    MessageToolCall {
        id: id.into(),
        name: name.into(),
        arguments,
    }
}

pub fn make_tool_call_response(calls: Vec<MessageToolCall>) -> CompletionResponse {
    CompletionResponse {
        message: Message::assistant_with_calls("", calls),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock-model".into(),
    }
}

// ── Mock tools ──

/// Always returns the same output.
pub struct ScriptedTool {
    name: String,
    output: String,
}

impl ScriptedTool {
    pub fn new(name: &str, output: &str) -> Self {
        Self {
            name: name.into(),
            output: output.into(),
        }
    }
}

#[async_trait]
impl Tool for ScriptedTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        "scripted test tool"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }
    async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        Ok(ToolResult::ok(self.output.clone()))
    }
}

/// Always errors.
pub struct FailingTool {
    name: String,
}

impl FailingTool {
    pub fn new(name: &str) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        "always fails"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }
    async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        Err(ToolError::ExecutionFailed {
            tool_name: self.name.clone(),
            reason: "scripted failure".into(),
        })
    }
}

/// Sleeps before answering; optionally declares a tight timeout.
pub struct SlowTool {
    name: String,
    delay: Duration,
    timeout: Duration,
}

impl SlowTool {
    pub fn new(name: &str, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        "slow test tool"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }
    async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        tokio::time::sleep(self.delay).await;
        Ok(ToolResult::ok("slow done"))
    }
    fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Counts executions; optionally requires confirmation.
pub struct CountingTool {
    name: String,
    confirm: bool,
    executions: Arc<AtomicUsize>,
}

impl CountingTool {
    pub fn new(name: &str, confirm: bool) -> Self {
        Self {
            name: name.into(),
            confirm,
            executions: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn executions(&self) -> Arc<AtomicUsize> {
        self.executions.clone()
    }
}

#[async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        "counting test tool"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }
    async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok(ToolResult::ok("counted"))
    }
    fn requires_confirmation(&self, _arguments: &serde_json::Value) -> bool {
        self.confirm
    }
}

/// Echoes `text` back, always requiring confirmation.
pub struct ConfirmEchoTool {
    name: String,
}

impl ConfirmEchoTool {
    pub fn new(name: &str) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Tool for ConfirmEchoTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        "guarded echo"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {"text": {"type": "string"}}
        })
    }
    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        Ok(ToolResult::ok(
            arguments["text"].as_str().unwrap_or("").to_string(),
        ))
    }
    fn requires_confirmation(&self, _arguments: &serde_json::Value) -> bool {
        true
    }
}

// ── Mock confirmation gates ──

/// Approves everything, optionally after a delay.
#[derive(Default)]
pub struct ApproveAllGate {
    delay: Duration,
}

impl ApproveAllGate {
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl ConfirmationGate for ApproveAllGate {
    async fn decide(&self, _request: ConfirmationRequest) -> Option<bool> {
        if self.delay > Duration::ZERO {
            tokio::time::sleep(self.delay).await;
        }
        Some(true)
    }
}

/// Rejects everything.
pub struct DenyAllGate;

#[async_trait]
impl ConfirmationGate for DenyAllGate {
    async fn decide(&self, _request: ConfirmationRequest) -> Option<bool> {
        Some(false)
    }
}
