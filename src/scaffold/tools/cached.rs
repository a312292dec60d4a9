//! Read-through tool invocation.

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::{ToolError, ToolRegistry};
use crate::cache::{Fingerprint, ToolCache};
use crate::metrics;

/// The result of one routed tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub output: Value,
    /// True when the output was served from the cache.
    pub cached: bool,
}

/// Routes every tool call through the [`ToolCache`].
#[derive(Clone)]
pub struct ToolInvoker {
    registry: Arc<ToolRegistry>,
    cache: Arc<ToolCache>,
}

impl ToolInvoker {
    pub fn new(registry: Arc<ToolRegistry>, cache: Arc<ToolCache>) -> Self {
        Self { registry, cache }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ToolCache> {
        &self.cache
    }

    /// Invokes `name` with `args`, reusing a cached result when one exists.
    ///
    /// Unknown tools fail before the cache is consulted.
    pub async fn invoke(&self, name: &str, args: Value) -> Result<ToolInvocation, ToolError> {
        let tool = self
            .registry
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        let fingerprint = Fingerprint::of(name, &args);
        let result = self
            .cache
            .get_or_compute(&fingerprint, name, || tool.invoke(args))
            .await;

        match &result {
            Ok((_, cached)) => {
                debug!(tool = name, fingerprint = %fingerprint, cached = cached, "Tool call finished");
                metrics::record_tool_call(name, if *cached { "cached" } else { "ok" });
            }
            Err(e) => {
                debug!(tool = name, error = %e, "Tool call failed");
                metrics::record_tool_call(name, e.kind());
            }
        }
        result.map(|(output, cached)| ToolInvocation { output, cached })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::EchoTool;
    use super::*;
    use serde_json::json;

    fn invoker(tool: Arc<EchoTool>) -> ToolInvoker {
        let mut registry = ToolRegistry::new();
        registry.register(tool);
        ToolInvoker::new(Arc::new(registry), Arc::new(ToolCache::in_memory(64)))
    }

    #[tokio::test]
    async fn test_second_identical_call_is_cached() {
        let tool = Arc::new(EchoTool::new("search"));
        let invoker = invoker(Arc::clone(&tool));

        let first = invoker.invoke("search", json!({"q": "a", "k": 3})).await.unwrap();
        let second = invoker.invoke("search", json!({"k": 3, "q": "a"})).await.unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.output, second.output);
        assert_eq!(tool.calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_tool_skips_cache() {
        let invoker = invoker(Arc::new(EchoTool::new("search")));
        let err = invoker.invoke("browse", json!({})).await.unwrap_err();
        assert_eq!(err, ToolError::UnknownTool("browse".to_string()));
        assert_eq!(invoker.cache().stats().misses, 0);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let tool = Arc::new(EchoTool::failing("search", ToolError::Timeout { seconds: 1 }));
        let invoker = invoker(Arc::clone(&tool));

        assert!(invoker.invoke("search", json!({"q": "a"})).await.is_err());
        assert!(invoker.invoke("search", json!({"q": "a"})).await.is_err());
        assert_eq!(tool.calls(), 2);
    }
}
