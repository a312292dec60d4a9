//! Tool definitions and registry for the research agent.
//!
//! Tools are stateless remote calls (search, browse, rerank, ...). The
//! agent picks one by name; the [`ToolRegistry`] resolves the name to an
//! implementation built at startup, and the [`ToolInvoker`] routes every
//! call through the tool cache.

pub mod cached;
pub mod http;

pub use cached::{ToolInvocation, ToolInvoker};
pub use http::HttpTool;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during a single tool call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    /// The agent asked for a tool that is not registered.
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// Arguments did not match what the tool accepts.
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// The remote service refused the request (4xx).
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// The call exceeded the tool's own timeout.
    #[error("Tool call timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    /// The request never completed (connection, TLS, body decode).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote service failed (5xx).
    #[error("Tool service unavailable: {0}")]
    Unavailable(String),
}

impl ToolError {
    /// Recoverable errors are shown to the agent so it can correct itself.
    /// The rest end the attempt.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ToolError::UnknownTool(_) | ToolError::InvalidArguments(_) | ToolError::Rejected(_)
        )
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::UnknownTool(_) => "unknown_tool",
            ToolError::InvalidArguments(_) => "invalid_arguments",
            ToolError::Rejected(_) => "rejected",
            ToolError::Timeout { .. } => "timeout",
            ToolError::Transport(_) => "transport",
            ToolError::Unavailable(_) => "unavailable",
        }
    }
}

/// An external capability the agent can call by name.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name the agent uses in its tool-call JSON. Also the cache namespace.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the `arguments` object.
    fn parameters_schema(&self) -> Value;

    /// Invokes the tool. Implementations enforce their own timeout.
    async fn invoke(&self, args: Value) -> Result<Value, ToolError>;
}

/// Tools available to one run, keyed by name.
///
/// Ordered by name so the rendered tool list is stable across runs.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `tool`, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Tool names in sorted order.
    pub fn list_tools(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Invokes `name` directly, bypassing the cache.
    pub async fn invoke(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        tool.invoke(args).await
    }

    /// Function-calling definitions for every tool, rendered into the
    /// system prompt.
    pub fn to_json_schema(&self) -> Value {
        self.tools
            .values()
            .map(|tool| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": tool.name(),
                        "description": tool.description(),
                        "parameters": tool.parameters_schema(),
                    }
                })
            })
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::EchoTool;
    use super::*;

    #[test]
    fn test_recoverable_kinds() {
        assert!(ToolError::UnknownTool("x".into()).is_recoverable());
        assert!(ToolError::InvalidArguments("x".into()).is_recoverable());
        assert!(ToolError::Rejected("x".into()).is_recoverable());
        assert!(!ToolError::Timeout { seconds: 5 }.is_recoverable());
        assert!(!ToolError::Transport("x".into()).is_recoverable());
        assert!(!ToolError::Unavailable("x".into()).is_recoverable());
    }

    #[test]
    fn test_tool_registry_new() {
        let registry = ToolRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_registry_invoke_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry.invoke("browse", serde_json::json!({})).await.unwrap_err();
        assert_eq!(err, ToolError::UnknownTool("browse".to_string()));
    }

    #[test]
    fn test_tool_registry_to_json_schema() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool::new("search")));
        registry.register(Arc::new(EchoTool::new("browse")));
        let schema = registry.to_json_schema();
        let arr = schema.as_array().expect("schema should be an array");
        assert_eq!(arr.len(), 2);

        assert_eq!(arr[0]["type"], "function");
        assert_eq!(arr[0]["function"]["name"], "browse");
        assert!(arr[0]["function"]["parameters"].is_object());
        assert_eq!(registry.list_tools(), vec!["browse", "search"]);
    }
}
