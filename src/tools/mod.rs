//! Tool System
//!
//! A fixed catalogue of built-in tools behind the [`Tool`] trait:
//!
//! ```text
//! ToolRegistry (immutable after construction)
//!   ├── read-only: read, ls, glob, grep, todo_read
//!   ├── bookkeeping: todo_write
//!   └── gated: write, edit, bash, fetch
//! ```
//!
//! The registry validates arguments against each tool's JSON schema before
//! dispatch and truncates oversized output. Permission checks happen one
//! layer up, in the agent loop.

mod builtin;
mod registry;
mod types;

pub use builtin::{
    BashTool, EditTool, FetchTool, GlobTool, GrepTool, LsTool, ReadTool, TodoReadTool,
    TodoWriteTool, WriteTool,
};
pub use registry::ToolRegistry;
pub use types::{Tool, ToolContext, ToolOutput};

/// Maximum output size in bytes before truncation
pub const MAX_OUTPUT_SIZE: usize = 100 * 1024; // 100KB

/// Maximum lines to read from a file
pub const MAX_READ_LINES: usize = 2000;

/// Maximum line length before truncation
pub const MAX_LINE_LENGTH: usize = 2000;

/// Maximum paths returned by `glob` and `ls`
pub const MAX_GLOB_RESULTS: usize = 1000;

/// Maximum matching lines returned by `grep`
pub const MAX_GREP_MATCHES: usize = 200;

pub const DEFAULT_BASH_TIMEOUT_MS: u64 = 120_000;

pub const MAX_BASH_TIMEOUT_MS: u64 = 600_000;
