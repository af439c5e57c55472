//! Tool trait: the abstraction over agent capabilities.
//!
//! Tools are what give the agent the ability to act in the world. Concrete
//! tools (browser, filesystem, shell) live outside this workspace; they
//! implement [`Tool`] or are wrapped in a [`FunctionTool`] and registered in a
//! [`ToolRegistry`] before a run starts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use crate::error::ToolError;
use crate::provider::ToolDefinition;

/// A request to execute a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the LLM's tool_call.id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON value
    pub arguments: serde_json::Value,
}

/// The recorded outcome of one tool call.
///
/// Exactly one of `content` / `error` is meaningful: a failed call keeps
/// `content` as `Null` and carries the message in `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result is for
    pub tool_call_id: String,

    /// Name of the tool that ran
    pub name: String,

    /// Success payload
    #[serde(default)]
    pub content: serde_json::Value,

    /// Error message, if the call failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Wall-clock execution time
    pub elapsed_ms: u64,
}

impl ToolResult {
    pub fn success(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: serde_json::Value,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            content,
            error: None,
            elapsed_ms,
        }
    }

    pub fn failure(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        error: impl Into<String>,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            content: serde_json::Value::Null,
            error: Some(error.into()),
            elapsed_ms,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Text form fed back to the model on the next turn.
    pub fn content_text(&self) -> String {
        if let Some(err) = &self.error {
            return format!("Error: {err}");
        }
        match &self.content {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Per-call context handed to a tool.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub tool_call_id: String,

    /// Run-scoped cancellation. Observing it is best-effort.
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(tool_call_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            cancel,
        }
    }
}

/// The core Tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "click", "create_plan").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: serde_json::Value) -> std::result::Result<serde_json::Value, ToolError>;

    /// Execute with access to the call context. Long-running tools override
    /// this to watch `ctx.cancel`.
    async fn execute_with_context(
        &self,
        arguments: serde_json::Value,
        _ctx: &ToolContext,
    ) -> std::result::Result<serde_json::Value, ToolError> {
        self.execute(arguments).await
    }

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

type ToolFuture =
    Pin<Box<dyn Future<Output = std::result::Result<serde_json::Value, ToolError>> + Send>>;

type BoxedHandler = Arc<dyn Fn(serde_json::Value) -> ToolFuture + Send + Sync>;

/// A tool built from a name, a schema and an async closure.
pub struct FunctionTool {
    name: String,
    description: String,
    schema: serde_json::Value,
    handler: BoxedHandler,
}

impl FunctionTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: serde_json::Value,
        handler: F,
    ) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<serde_json::Value, ToolError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            handler: Arc::new(move |args| -> ToolFuture { Box::pin(handler(args)) }),
        }
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.schema.clone()
    }

    async fn execute(&self, arguments: serde_json::Value) -> std::result::Result<serde_json::Value, ToolError> {
        (self.handler)(arguments).await
    }
}

/// Check arguments against the parts of a JSON Schema the runtime enforces:
/// the value must be an object and every `required` property must be present.
///
/// Property types are not checked; text-marker engines deliver every value
/// as a string and handlers are expected to coerce.
pub fn validate_arguments(
    schema: &serde_json::Value,
    arguments: &serde_json::Value,
) -> std::result::Result<(), ToolError> {
    let Some(object) = arguments.as_object() else {
        return Err(ToolError::InvalidArguments(format!(
            "expected a JSON object, got {arguments}"
        )));
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        let missing: Vec<&str> = required
            .iter()
            .filter_map(|r| r.as_str())
            .filter(|key| !object.contains_key(*key))
            .collect();
        if !missing.is_empty() {
            return Err(ToolError::InvalidArguments(format!(
                "missing required properties: {}",
                missing.join(", ")
            )));
        }
    }

    Ok(())
}

/// A registry of available tools.
///
/// Registration order is preserved so that prompts listing the tools are
/// deterministic. Names are unique: registering a second tool with an
/// existing name is an error.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Register a tool. Fails if a tool with the same name already exists.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> std::result::Result<(), ToolError> {
        let name = tool.name().to_string();
        if name.is_empty() {
            return Err(ToolError::InvalidArguments("tool name must not be empty".into()));
        }
        if self.index.contains_key(&name) {
            return Err(ToolError::DuplicateName(name));
        }
        self.index.insert(name, self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    /// Get all tool definitions (for sending to the LLM).
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.to_definition()).collect()
    }

    /// Execute a tool call after validating its arguments.
    pub async fn execute(
        &self,
        call: &ToolCall,
        ctx: &ToolContext,
    ) -> std::result::Result<serde_json::Value, ToolError> {
        let tool = self
            .get(&call.name)
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;
        validate_arguments(&tool.parameters_schema(), &call.arguments)?;
        tool.execute_with_context(call.arguments.clone(), ctx).await
    }

    /// List all registered tool names, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
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
