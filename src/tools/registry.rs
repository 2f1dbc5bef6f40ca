//! Tool Registry
//!
//! Lookup, schema validation and dispatch for the built-in catalogue.
//! Built once and shared read-only across sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::Instrument;

use super::builtin::{
    BashTool, EditTool, FetchTool, GlobTool, GrepTool, LsTool, ReadTool, TodoReadTool,
    TodoWriteTool, WriteTool,
};
use super::types::{Tool, ToolContext, ToolOutput};
use super::MAX_OUTPUT_SIZE;
use crate::error::{CodeError, Result};
use crate::llm::ToolDefinition;
use crate::telemetry;

/// Tool registry for the built-in catalogue
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    /// Registration order, so definitions are stable across requests
    order: Vec<String>,
}

impl ToolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in tool
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        let tools: Vec<Arc<dyn Tool>> = vec![
            Arc::new(ReadTool),
            Arc::new(LsTool),
            Arc::new(GlobTool),
            Arc::new(GrepTool),
            Arc::new(WriteTool),
            Arc::new(EditTool),
            Arc::new(BashTool),
            Arc::new(FetchTool::new()),
            Arc::new(TodoWriteTool),
            Arc::new(TodoReadTool),
        ];
        for tool in tools {
            registry.register(tool);
        }
        registry
    }

    /// Register a tool. A second tool with the same name is rejected.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> bool {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            tracing::warn!("Rejected registration of tool '{}': name already taken", name);
            return false;
        }
        tracing::debug!("Registering tool: {}", name);
        self.order.push(name.clone());
        self.tools.insert(name, tool);
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool names in registration order
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// All tool definitions for the model, in registration order
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect()
    }

    /// Whether calls to `name` must pass the permission gate.
    /// Unknown tools are not gated; dispatch reports them instead.
    pub fn requires_permission(&self, name: &str) -> bool {
        self.tools
            .get(name)
            .is_some_and(|tool| tool.requires_permission())
    }

    /// One-line summary of a call for permission prompts
    pub fn summarize(&self, name: &str, args: &Value) -> String {
        match self.tools.get(name) {
            Some(tool) => tool.summarize(args),
            None => name.to_string(),
        }
    }

    /// Validate and execute a call.
    ///
    /// `Err` covers unknown tools, invalid arguments, cancellation, timeouts
    /// and fatal tool failures; the agent loop reports all of them to the
    /// model as error results.
    pub async fn execute(&self, name: &str, args: &Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let span = tracing::info_span!(
            telemetry::SPAN_TOOL_EXECUTE,
            "a3s.tool.name" = %name,
            "a3s.session.id" = %ctx.session_id,
            "a3s.tool.success" = tracing::field::Empty,
            "a3s.tool.duration_ms" = tracing::field::Empty,
        );

        async {
            let start = Instant::now();
            let tool = self
                .get(name)
                .ok_or_else(|| CodeError::UnknownTool(name.to_string()))?;

            a3s_tools_core::validate_args(&tool.parameters(), args).map_err(|e| {
                CodeError::InvalidArguments {
                    tool: name.to_string(),
                    reason: e.to_string(),
                }
            })?;

            if ctx.cancel.is_cancelled() {
                return Err(CodeError::Cancelled);
            }

            let result = tool.execute(args, ctx).await.map(|mut output| {
                output.content = a3s_tools_core::truncate_output(&output.content, MAX_OUTPUT_SIZE);
                output
            });

            let success = matches!(&result, Ok(output) if !output.is_error);
            telemetry::record_tool_result(name, success, start.elapsed());

            result
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct MockTool {
        name: String,
        output: String,
    }

    #[async_trait]
    impl Tool for MockTool {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            "A mock tool for testing"
        }

        fn parameters(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "value": { "type": "string" } },
                "required": ["value"]
            })
        }

        fn requires_permission(&self) -> bool {
            false
        }

        async fn execute(&self, _args: &Value, _ctx: &ToolContext) -> Result<ToolOutput> {
            Ok(ToolOutput::success(self.output.clone()))
        }
    }

    fn mock(name: &str, output: &str) -> Arc<dyn Tool> {
        Arc::new(MockTool {
            name: name.to_string(),
            output: output.to_string(),
        })
    }

    fn ctx() -> (tempfile::TempDir, ToolContext) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path(), "s1");
        (dir, ctx)
    }

    struct SpanNames(Arc<std::sync::Mutex<Vec<String>>>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for SpanNames {
        fn on_new_span(
            &self,
            attrs: &tracing::span::Attributes<'_>,
            _id: &tracing::span::Id,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            self.0.lock().unwrap().push(attrs.metadata().name().to_string());
        }
    }

    #[tokio::test]
    async fn test_execute_opens_tool_span() {
        use tracing_subscriber::layer::SubscriberExt;

        let names = Arc::new(std::sync::Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(SpanNames(names.clone()));
        let _guard = tracing::subscriber::set_default(subscriber);

        let (_dir, ctx) = ctx();
        let registry = ToolRegistry::builtin();
        registry.execute("ls", &json!({}), &ctx).await.unwrap();
        assert!(names
            .lock()
            .unwrap()
            .iter()
            .any(|n| n == telemetry::SPAN_TOOL_EXECUTE));
    }

    #[test]
    fn test_builtin_catalogue() {
        let registry = ToolRegistry::builtin();
        assert_eq!(registry.len(), 10);
        for gated in ["write", "edit", "bash", "fetch"] {
            assert!(registry.requires_permission(gated), "{} should be gated", gated);
        }
        for open in ["read", "ls", "glob", "grep", "todo_write", "todo_read"] {
            assert!(!registry.requires_permission(open), "{} should not be gated", open);
        }
        assert!(!registry.requires_permission("nope"));
    }

    #[test]
    fn test_definitions_keep_registration_order() {
        let registry = ToolRegistry::builtin();
        let names: Vec<String> = registry.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, registry.names());
        assert_eq!(names[0], "read");
        for def in registry.definitions() {
            assert_eq!(def.parameters["type"], "object", "{} schema", def.name);
        }
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = ToolRegistry::new();
        assert!(registry.register(mock("a", "first")));
        assert!(!registry.register(mock("a", "second")));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_execute_unknown_tool() {
        let (_dir, ctx) = ctx();
        let err = ToolRegistry::new()
            .execute("missing", &json!({}), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Unknown tool: missing");
    }

    #[tokio::test]
    async fn test_execute_validates_arguments() {
        let (_dir, ctx) = ctx();
        let mut registry = ToolRegistry::new();
        registry.register(mock("echo", "ok"));

        let err = registry.execute("echo", &json!({}), &ctx).await.unwrap_err();
        assert!(matches!(err, CodeError::InvalidArguments { .. }));

        let err = registry
            .execute("echo", &json!({"value": 3}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, CodeError::InvalidArguments { .. }));

        let output = registry
            .execute("echo", &json!({"value": "x"}), &ctx)
            .await
            .unwrap();
        assert_eq!(output.content, "ok");
    }

    #[tokio::test]
    async fn test_execute_truncates_output() {
        let (_dir, ctx) = ctx();
        let mut registry = ToolRegistry::new();
        registry.register(mock("big", &"x".repeat(MAX_OUTPUT_SIZE + 10)));

        let output = registry
            .execute("big", &json!({"value": "x"}), &ctx)
            .await
            .unwrap();
        assert!(output.content.ends_with("[output truncated: 10 more bytes]"));
    }

    #[tokio::test]
    async fn test_execute_respects_cancelled_context() {
        let (_dir, ctx) = ctx();
        ctx.cancel.cancel();
        let mut registry = ToolRegistry::new();
        registry.register(mock("echo", "ok"));
        let err = registry
            .execute("echo", &json!({"value": "x"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, CodeError::Cancelled));
    }
}
