//! Built-in tools

mod bash;
mod edit;
mod fetch;
mod glob;
mod grep;
mod ls;
mod read;
mod todo;
mod write;

pub use bash::BashTool;
pub use edit::EditTool;
pub use fetch::FetchTool;
pub use glob::GlobTool;
pub use grep::GrepTool;
pub use ls::LsTool;
pub use read::ReadTool;
pub use todo::{TodoReadTool, TodoWriteTool};
pub use write::WriteTool;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{CodeError, Result};

/// Deserialize validated arguments into a tool's typed input
pub(crate) fn parse_input<T: DeserializeOwned>(tool: &str, args: &Value) -> Result<T> {
    serde_json::from_value(args.clone()).map_err(|e| CodeError::InvalidArguments {
        tool: tool.to_string(),
        reason: e.to_string(),
    })
}

/// Clip to `max` characters, marking the cut
pub(crate) fn clip_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Run blocking filesystem work off the async runtime
pub(crate) async fn blocking<T, F>(tool: &str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CodeError::Tool {
            tool: tool.to_string(),
            message: format!("worker task failed: {}", e),
        })?
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::tools::ToolContext;

    pub fn workspace() -> (tempfile::TempDir, ToolContext) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path(), "test-session");
        (dir, ctx)
    }
}
