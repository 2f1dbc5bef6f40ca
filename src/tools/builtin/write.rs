use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::parse_input;
use crate::error::{CodeError, Result};
use crate::tools::{Tool, ToolContext, ToolOutput};

/// Create or overwrite a file
pub struct WriteTool;

#[derive(Debug, Deserialize)]
struct WriteInput {
    path: String,
    content: String,
}

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Write content to a file in the workspace, creating it and any missing parent directories. Overwrites existing files."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, relative to the workspace"
                },
                "content": {
                    "type": "string",
                    "description": "Full file content"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn summarize(&self, args: &Value) -> String {
        let bytes = args["content"].as_str().map(str::len).unwrap_or(0);
        format!(
            "Write {} ({} bytes)",
            args["path"].as_str().unwrap_or("?"),
            bytes
        )
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let input: WriteInput = parse_input(self.name(), args)?;
        let path = ctx.resolve_path_for_write(self.name(), &input.path)?;

        if path.is_dir() {
            return Ok(ToolOutput::error(format!("'{}' is a directory", input.path)));
        }

        let existed = path.exists();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, input.content.as_bytes())
            .await
            .map_err(|e| CodeError::Tool {
                tool: self.name().to_string(),
                message: format!("cannot write '{}': {}", input.path, e),
            })?;

        let shown = ctx.display_path(&path);
        tracing::debug!(path = %shown, bytes = input.content.len(), "File written");
        Ok(ToolOutput::success(format!(
            "{} {} ({} bytes)",
            if existed { "Overwrote" } else { "Created" },
            shown,
            input.content.len()
        ))
        .with_metadata(json!({
            "path": shown,
            "bytes": input.content.len(),
            "created": !existed,
        })))
    }
}
