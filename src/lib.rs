//! A3S Code
//!
//! Core of a terminal AI coding assistant: a streaming agent loop that
//! drives an LLM provider, executes built-in tools inside a workspace
//! sandbox behind a permission gate, keeps a per-session todo list, and
//! persists every message so sessions can be resumed.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_code::{AgentEvent, CodeConfig, SessionManager};
//!
//! # async fn run() -> a3s_code::Result<()> {
//! let config = CodeConfig::load(None, std::path::Path::new("."))?;
//! let manager = SessionManager::from_config(&config, None, None, std::path::Path::new(".")).await?;
//! let session = manager.create_session("").await?;
//!
//! let mut run = manager.run(&session.id, "What files handle auth?", Vec::new()).await?;
//! while let Some(event) = run.next_event().await {
//!     if let AgentEvent::TextDelta { text } = event {
//!         print!("{text}");
//!     }
//! }
//! let outcome = run.wait().await?;
//! println!("\n{} tokens", outcome.usage.total_tokens);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! SessionManager (one active run per session)
//!   +-- AgentLoop
//!   |     +-- LlmClient (Anthropic / OpenAI-compatible, streaming)
//!   |     +-- ToolRegistry (built-in tools, schema validation)
//!   |     +-- PermissionGate (approve once / for session / deny)
//!   |     +-- ContinuationController (todo reminders, auto-continue)
//!   +-- SessionStore (file or memory)
//! ```

pub mod agent;
pub mod config;
pub mod continuation;
pub mod error;
pub mod llm;
pub mod permission;
pub mod prompts;
pub mod retry;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod todo;
pub mod tools;

// Re-export key types at crate root for ergonomic usage
pub use agent::{AgentConfig, AgentEvent, AgentLoop, Attachment, RunContext, RunOutcome, RunState};
pub use config::CodeConfig;
pub use continuation::{AgentKind, ContinuationConfig, ContinuationController};
pub use error::{CodeError, Result};
pub use llm::{LlmClient, LlmConfig, Message, Part, Role, TokenUsage};
pub use permission::{ApprovalScope, PermissionDecision, PermissionEvent, PermissionGate};
pub use session::{RunHandle, SessionManager};
pub use store::{FileSessionStore, MemorySessionStore, Session, SessionStore};
pub use todo::{TodoItem, TodoPriority, TodoState, TodoStatus};
pub use tools::{Tool, ToolContext, ToolOutput, ToolRegistry};
