//! Per-session todo tracking
//!
//! The model maintains a todo list through the `todo_write` tool. The list and
//! the auto-continuation counter live in one [`TodoState`] per session, guarded
//! by a single lock and shared by handle with the tools and the agent loop.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    /// Abandoned; no longer counts as outstanding work
    Cancelled,
}

impl fmt::Display for TodoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TodoStatus::Pending => write!(f, "pending"),
            TodoStatus::InProgress => write!(f, "in_progress"),
            TodoStatus::Completed => write!(f, "completed"),
            TodoStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for TodoStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_lowercase().as_str() {
            "in_progress" | "inprogress" | "in-progress" | "active" => TodoStatus::InProgress,
            "completed" | "complete" | "done" => TodoStatus::Completed,
            "cancelled" | "canceled" => TodoStatus::Cancelled,
            _ => TodoStatus::Pending,
        })
    }
}

impl TodoStatus {
    /// Still outstanding (pending or in progress)
    pub fn is_incomplete(&self) -> bool {
        matches!(self, TodoStatus::Pending | TodoStatus::InProgress)
    }
}

/// Task priority level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TodoPriority {
    High,
    #[default]
    Medium,
    Low,
}

impl TodoPriority {
    /// Lower rank sorts first
    pub fn rank(&self) -> u8 {
        match self {
            TodoPriority::High => 0,
            TodoPriority::Medium => 1,
            TodoPriority::Low => 2,
        }
    }
}

impl fmt::Display for TodoPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TodoPriority::High => write!(f, "high"),
            TodoPriority::Medium => write!(f, "medium"),
            TodoPriority::Low => write!(f, "low"),
        }
    }
}

impl FromStr for TodoPriority {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_lowercase().as_str() {
            "high" | "h" | "1" => TodoPriority::High,
            "low" | "l" | "3" => TodoPriority::Low,
            _ => TodoPriority::Medium,
        })
    }
}

/// A todo item owned by a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub status: TodoStatus,
    #[serde(default)]
    pub priority: TodoPriority,
}

impl TodoItem {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            status: TodoStatus::Pending,
            priority: TodoPriority::Medium,
        }
    }

    pub fn with_priority(mut self, priority: TodoPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_status(mut self, status: TodoStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_incomplete(&self) -> bool {
        self.status.is_incomplete()
    }
}

/// Render a todo list as a checklist for the model or the terminal
pub fn render_todos(todos: &[TodoItem]) -> String {
    if todos.is_empty() {
        return "No todos.".to_string();
    }
    todos
        .iter()
        .map(|todo| {
            let mark = match todo.status {
                TodoStatus::Completed => "[x]",
                TodoStatus::InProgress => "[~]",
                TodoStatus::Cancelled => "[-]",
                TodoStatus::Pending => "[ ]",
            };
            format!("{} {} ({}) {}", mark, todo.id, todo.priority, todo.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Data guarded by a session's todo lock
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionTodos {
    pub todos: Vec<TodoItem>,
    /// Continuations injected since the last user prompt
    pub continuation_count: u32,
}

impl SessionTodos {
    pub fn incomplete(&self) -> impl Iterator<Item = &TodoItem> {
        self.todos.iter().filter(|t| t.is_incomplete())
    }

    /// Highest-priority incomplete item; in-progress wins ties, then list order
    pub fn next_item(&self) -> Option<&TodoItem> {
        self.incomplete().min_by_key(|t| {
            (
                t.priority.rank(),
                u8::from(t.status != TodoStatus::InProgress),
            )
        })
    }
}

/// Shared handle to one session's todo list and continuation counter
#[derive(Debug, Clone, Default)]
pub struct TodoState {
    inner: Arc<Mutex<SessionTodos>>,
}

impl TodoState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore persisted state
    pub fn from_parts(todos: Vec<TodoItem>, continuation_count: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionTodos {
                todos,
                continuation_count,
            })),
        }
    }

    pub async fn snapshot(&self) -> SessionTodos {
        self.inner.lock().await.clone()
    }

    pub async fn todos(&self) -> Vec<TodoItem> {
        self.inner.lock().await.todos.clone()
    }

    /// Replace the whole list
    pub async fn set_todos(&self, todos: Vec<TodoItem>) {
        self.inner.lock().await.todos = todos;
    }

    pub async fn continuation_count(&self) -> u32 {
        self.inner.lock().await.continuation_count
    }

    /// Returns the new count
    pub async fn increment_continuations(&self) -> u32 {
        let mut guard = self.inner.lock().await;
        guard.continuation_count = guard.continuation_count.saturating_add(1);
        guard.continuation_count
    }

    pub async fn reset_continuations(&self) {
        self.inner.lock().await.continuation_count = 0;
    }
}
