//! Tool trait — the abstraction over executable capabilities.
//!
//! Concrete tools live outside the engine. The contract here is what the
//! dispatcher needs: a schema to advertise, an async `execute`, an
//! argument-sensitive confirmation predicate, and a per-tool timeout.

use crate::error::ToolError;
use crate::provider::ToolDefinition;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// The raw result of a tool execution, before output shaping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the tool executed successfully
    pub success: bool,

    /// The output content
    pub output: String,

    /// Optional structured data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            data: None,
        }
    }

    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            data: None,
        }
    }
}

/// The core Tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    async fn execute(
        &self,
        arguments: serde_json::Value,
    ) -> std::result::Result<ToolResult, ToolError>;

    /// Whether this invocation needs human approval before executing.
    ///
    /// Argument-sensitive so a tool can gate only its destructive modes
    /// (e.g. a file tool confirming writes but not reads).
    fn requires_confirmation(&self, _arguments: &serde_json::Value) -> bool {
        false
    }

    /// Wall-clock budget for a single execution.
    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    /// Convert this tool into a ToolDefinition for sending to the model.
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
/// The engine uses this to advertise definitions to the model and to
/// resolve names when the model requests invocations. Workers only read
/// the registry; it is shared behind an `Arc`.
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Resolve a tool by name.
    pub fn resolve(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Get all tool definitions (for sending to the model).
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
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

/// A pending confirmation, correlated to one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    /// Correlation id; the decision must reference it.
    pub confirm_id: String,

    /// Tool awaiting approval.
    pub tool_name: String,

    /// The arguments the tool would run with.
    pub arguments: serde_json::Value,
}

/// The human-approval seam.
///
/// The dispatcher emits a confirmation-request event carrying the
/// correlation id, then awaits `decide`. `Some(true)` approves,
/// `Some(false)` rejects, `None` means nobody answered (treated as a
/// denial). Only the requesting invocation suspends; batch siblings
/// proceed.
#[async_trait]
pub trait ConfirmationGate: Send + Sync {
    async fn decide(&self, request: ConfirmationRequest) -> Option<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes back the input"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string" }
                },
                "required": ["text"]
            })
        }
        async fn execute(
            &self,
            arguments: serde_json::Value,
        ) -> std::result::Result<ToolResult, ToolError> {
            let text = arguments["text"].as_str().unwrap_or("").to_string();
            Ok(ToolResult::ok(text))
        }
        fn requires_confirmation(&self, arguments: &serde_json::Value) -> bool {
            arguments["text"].as_str() == Some("dangerous")
        }
    }

    #[test]
    fn registry_register_and_resolve() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));
        assert!(registry.resolve("echo").is_some());
        assert!(registry.resolve("nonexistent").is_none());
    }

    #[test]
    fn definitions_are_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));
        let defs = registry.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
    }

    #[test]
    fn confirmation_is_argument_sensitive() {
        let tool = EchoTool;
        assert!(tool.requires_confirmation(&serde_json::json!({"text": "dangerous"})));
        assert!(!tool.requires_confirmation(&serde_json::json!({"text": "benign"})));
    }

    #[tokio::test]
    async fn tool_executes() {
        let tool = EchoTool;
        let result = tool
            .execute(serde_json::json!({"text": "hello"}))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output, "hello");
    }
}
