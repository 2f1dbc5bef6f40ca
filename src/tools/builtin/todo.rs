use std::collections::HashSet;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::parse_input;
use crate::error::{CodeError, Result};
use crate::todo::{render_todos, TodoItem, TodoPriority, TodoStatus};
use crate::tools::{Tool, ToolContext, ToolOutput};

/// Replace the session's todo list
pub struct TodoWriteTool;

/// Render the session's todo list
pub struct TodoReadTool;

#[derive(Debug, Deserialize)]
struct TodoWriteInput {
    todos: Vec<RawTodo>,
}

/// Lenient wire form; status and priority accept common spellings
#[derive(Debug, Deserialize)]
struct RawTodo {
    #[serde(default)]
    id: Option<String>,
    content: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    priority: Option<String>,
}

impl RawTodo {
    fn into_item(self, index: usize) -> TodoItem {
        let id = self
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| (index + 1).to_string());
        let status: TodoStatus = self
            .status
            .as_deref()
            .map(|s| s.parse().unwrap_or_default())
            .unwrap_or_default();
        let priority: TodoPriority = self
            .priority
            .as_deref()
            .map(|p| p.parse().unwrap_or_default())
            .unwrap_or_default();
        TodoItem {
            id,
            content: self.content,
            status,
            priority,
        }
    }
}

#[async_trait]
impl Tool for TodoWriteTool {
    fn name(&self) -> &str {
        "todo_write"
    }

    fn description(&self) -> &str {
        "Create or update the task list for this session. Always send the complete list; it replaces the previous one. Mark exactly one item in_progress while working on it and mark items completed as soon as they are done."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "todos": {
                    "type": "array",
                    "description": "The complete, updated todo list",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "string", "description": "Stable identifier" },
                            "content": { "type": "string", "description": "What needs to be done" },
                            "status": {
                                "type": "string",
                                "description": "pending, in_progress, completed or cancelled"
                            },
                            "priority": {
                                "type": "string",
                                "description": "high, medium or low"
                            }
                        },
                        "required": ["content"]
                    }
                }
            },
            "required": ["todos"]
        })
    }

    fn requires_permission(&self) -> bool {
        false
    }

    fn summarize(&self, args: &Value) -> String {
        let count = args["todos"].as_array().map(Vec::len).unwrap_or(0);
        format!("Update todo list ({} items)", count)
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let input: TodoWriteInput = parse_input(self.name(), args)?;
        let todos: Vec<TodoItem> = input
            .todos
            .into_iter()
            .enumerate()
            .map(|(i, raw)| raw.into_item(i))
            .collect();

        let mut seen = HashSet::new();
        if let Some(dup) = todos.iter().find(|t| !seen.insert(t.id.as_str())) {
            return Err(CodeError::InvalidArguments {
                tool: self.name().to_string(),
                reason: format!("duplicate todo id '{}'", dup.id),
            });
        }

        let incomplete = todos.iter().filter(|t| t.is_incomplete()).count();
        let rendered = render_todos(&todos);
        tracing::debug!(
            session_id = %ctx.session_id,
            total = todos.len(),
            incomplete,
            "Todo list updated"
        );

        let metadata = json!({ "todos": todos });
        ctx.todos.set_todos(todos).await;

        Ok(ToolOutput::success(format!(
            "Todo list updated ({} incomplete)\n{}",
            incomplete, rendered
        ))
        .with_metadata(metadata))
    }
}

#[async_trait]
impl Tool for TodoReadTool {
    fn name(&self) -> &str {
        "todo_read"
    }

    fn description(&self) -> &str {
        "Show the current task list for this session."
    }

    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    fn requires_permission(&self) -> bool {
        false
    }

    fn summarize(&self, _args: &Value) -> String {
        "Read todo list".to_string()
    }

    async fn execute(&self, _args: &Value, ctx: &ToolContext) -> Result<ToolOutput> {
        Ok(ToolOutput::success(render_todos(&ctx.todos.todos().await)))
    }
}
