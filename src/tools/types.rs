//! Core types for the tool system

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use a3s_tools_core::PathError;

use crate::error::{CodeError, Result};
use crate::todo::TodoState;

/// Tool execution context
///
/// Everything a tool may touch: the sandbox root, the owning session, the
/// session's todo list, and the cancellation signal of the current call.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Workspace root directory (sandbox boundary), canonical
    pub workspace: PathBuf,
    pub session_id: String,
    pub cancel: CancellationToken,
    pub todos: TodoState,
}

impl ToolContext {
    /// Context rooted at `workspace`, canonicalized here. Blocks on the
    /// filesystem; long-lived owners should canonicalize once and use
    /// [`ToolContext::with_canonical_workspace`].
    pub fn new(workspace: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        let workspace = workspace.into();
        // Canonicalize to handle symlinks (e.g., /var -> /private/var on macOS)
        let workspace = workspace.canonicalize().unwrap_or(workspace);
        Self::with_canonical_workspace(workspace, session_id)
    }

    /// Context for a workspace path that is already canonical
    pub fn with_canonical_workspace(workspace: PathBuf, session_id: impl Into<String>) -> Self {
        Self {
            workspace,
            session_id: session_id.into(),
            cancel: CancellationToken::new(),
            todos: TodoState::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_todos(mut self, todos: TodoState) -> Self {
        self.todos = todos;
        self
    }

    /// Resolve an existing path inside the workspace
    pub fn resolve_path(&self, tool: &str, path: &str) -> Result<PathBuf> {
        a3s_tools_core::resolve_path(&self.workspace, path).map_err(|e| path_error(tool, e))
    }

    /// Resolve a path that may not exist yet
    pub fn resolve_path_for_write(&self, tool: &str, path: &str) -> Result<PathBuf> {
        a3s_tools_core::resolve_path_for_write(&self.workspace, path)
            .map_err(|e| path_error(tool, e))
    }

    /// Path relative to the workspace, for display
    pub fn display_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.workspace)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

fn path_error(tool: &str, err: PathError) -> CodeError {
    match err {
        PathError::EscapesWorkspace(_) => CodeError::InvalidArguments {
            tool: tool.to_string(),
            reason: err.to_string(),
        },
        PathError::Unresolvable { .. } => CodeError::Tool {
            tool: tool.to_string(),
            message: err.to_string(),
        },
    }
}

/// Tool execution output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    /// Tool-level failure, reported to the model rather than aborting the run
    #[serde(default)]
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            metadata: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Tool trait - the capability every built-in tool provides
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (must be unique within registry)
    fn name(&self) -> &str;

    /// Human-readable description for the model
    fn description(&self) -> &str;

    /// JSON Schema for tool parameters
    fn parameters(&self) -> serde_json::Value;

    /// Whether a call must pass the permission gate. Defaults to gated.
    fn requires_permission(&self) -> bool {
        true
    }

    /// One-line description of a call, shown in permission prompts
    fn summarize(&self, args: &serde_json::Value) -> String {
        format!("{} {}", self.name(), args)
    }

    /// Execute with schema-validated arguments
    async fn execute(&self, args: &serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput>;
}
