//! Todo-driven auto-continuation
//!
//! Two independent checks run against a session's [`TodoState`]:
//! - before each round-trip, [`ContinuationController::todo_reminder`] nudges
//!   the model to create a todo list when it has none;
//! - after a natural stop, [`ContinuationController::should_continue`] decides
//!   whether to re-enter the loop because work is still outstanding.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::llm::FinishReason;
use crate::prompts::{render, TODO_CONTINUATION, TODO_REMINDER};
use crate::todo::{SessionTodos, TodoState};

/// Default cap on automatic continuations per user prompt
pub const DEFAULT_MAX_CONTINUATIONS: u32 = 10;

/// Character budget for the next-item excerpt in a continuation prompt
pub const CONTINUATION_EXCERPT_CHARS: usize = 150;

/// Auto-continuation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuationConfig {
    pub enabled: bool,
    pub max_continuations: u32,
    /// Send the empty-todo-list reminder before round-trips
    pub reminder_enabled: bool,
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_continuations: DEFAULT_MAX_CONTINUATIONS,
            reminder_enabled: true,
        }
    }
}

/// Which kind of agent is driving the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Interactive coding agent
    #[default]
    Coder,
    /// Headless task agent
    Task,
    /// Single-shot helper with no task tracking
    Plain,
}

impl AgentKind {
    pub fn tracks_todos(&self) -> bool {
        matches!(self, AgentKind::Coder | AgentKind::Task)
    }
}

/// Decides when to inject reminders and continuation turns
#[derive(Debug, Clone, Default)]
pub struct ContinuationController {
    config: ContinuationConfig,
    kind: AgentKind,
}

impl ContinuationController {
    pub fn new(config: ContinuationConfig, kind: AgentKind) -> Self {
        Self { config, kind }
    }

    pub fn config(&self) -> &ContinuationConfig {
        &self.config
    }

    /// Pure decision over a locked snapshot of the session's todo data
    pub fn evaluate(
        &self,
        session_id: &str,
        todos: &SessionTodos,
        reason: FinishReason,
        cancelled: bool,
    ) -> bool {
        if !self.config.enabled
            || !self.kind.tracks_todos()
            || reason != FinishReason::Stop
            || session_id.is_empty()
            || cancelled
            || todos.continuation_count >= self.config.max_continuations
        {
            return false;
        }

        let mut incomplete = todos.incomplete().peekable();
        if incomplete.peek().is_none() {
            return false;
        }
        // Malformed state: never continue toward an item with no content
        if incomplete.any(|t| t.content.trim().is_empty()) {
            tracing::warn!(session_id, "Incomplete todo with empty content; not continuing");
            return false;
        }
        true
    }

    /// Whether to synthesize another turn after a round-trip ended with `reason`
    pub async fn should_continue(
        &self,
        session_id: &str,
        state: &TodoState,
        reason: FinishReason,
        cancel: &CancellationToken,
    ) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        let snapshot = state.snapshot().await;
        self.evaluate(session_id, &snapshot, reason, cancel.is_cancelled())
    }

    /// Render the continuation directive from a snapshot
    pub fn continuation_prompt_for(todos: &SessionTodos) -> String {
        let count = todos.incomplete().count();
        let next = todos
            .next_item()
            .map(|t| truncate_chars(t.content.trim(), CONTINUATION_EXCERPT_CHARS))
            .unwrap_or_default();
        render(
            TODO_CONTINUATION,
            &[("count", &count.to_string()), ("next", &next)],
        )
        .trim()
        .to_string()
    }

    pub async fn build_continuation_prompt(&self, session_id: &str, state: &TodoState) -> String {
        let snapshot = state.snapshot().await;
        tracing::debug!(
            session_id,
            incomplete = snapshot.incomplete().count(),
            "Building continuation prompt"
        );
        Self::continuation_prompt_for(&snapshot)
    }

    /// Returns the new count
    pub async fn increment(&self, state: &TodoState) -> u32 {
        state.increment_continuations().await
    }

    pub async fn reset(&self, state: &TodoState) {
        state.reset_continuations().await;
    }

    /// Reminder to send before a round-trip, if the session has no todos at all
    pub async fn todo_reminder(&self, session_id: &str, state: &TodoState) -> Option<String> {
        if !self.config.reminder_enabled || !self.kind.tracks_todos() || session_id.is_empty() {
            return None;
        }
        if state.snapshot().await.todos.is_empty() {
            Some(TODO_REMINDER.trim().to_string())
        } else {
            None
        }
    }
}

/// Truncate to `max` characters, ending with an ellipsis when cut
fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept.trim_end())
}
