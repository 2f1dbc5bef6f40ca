use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{clip_chars, parse_input};
use crate::error::{CodeError, Result};
use crate::tools::{Tool, ToolContext, ToolOutput, MAX_LINE_LENGTH, MAX_READ_LINES};

/// Bytes inspected when sniffing for binary content
const BINARY_SNIFF_BYTES: usize = 8 * 1024;

/// Read a text file with line numbers
pub struct ReadTool;

#[derive(Debug, Deserialize)]
struct ReadInput {
    path: String,
    /// 1-based line to start at
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read a text file from the workspace. Returns lines prefixed with line numbers. Use offset and limit to page through large files."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, relative to the workspace"
                },
                "offset": {
                    "type": "integer",
                    "description": "Line number to start reading from (1-based). Default: 1"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return. Default: 2000"
                }
            },
            "required": ["path"]
        })
    }

    fn requires_permission(&self) -> bool {
        false
    }

    fn summarize(&self, args: &Value) -> String {
        format!("Read {}", args["path"].as_str().unwrap_or("?"))
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let input: ReadInput = parse_input(self.name(), args)?;
        let path = ctx.resolve_path(self.name(), &input.path)?;

        if path.is_dir() {
            return Ok(ToolOutput::error(format!(
                "'{}' is a directory; use ls to list it",
                input.path
            )));
        }

        let bytes = tokio::fs::read(&path).await.map_err(|e| CodeError::Tool {
            tool: self.name().to_string(),
            message: format!("cannot read '{}': {}", input.path, e),
        })?;

        if bytes[..bytes.len().min(BINARY_SNIFF_BYTES)].contains(&0) {
            return Ok(ToolOutput::error(format!(
                "'{}' appears to be a binary file",
                input.path
            )));
        }

        let content = String::from_utf8_lossy(&bytes);
        if content.is_empty() {
            return Ok(ToolOutput::success("(empty file)"));
        }

        let total = content.lines().count();
        let start = input.offset.unwrap_or(1).max(1);
        let limit = input.limit.unwrap_or(MAX_READ_LINES).clamp(1, MAX_READ_LINES);

        if start > total {
            return Ok(ToolOutput::error(format!(
                "offset {} is past the end of '{}' ({} lines)",
                start, input.path, total
            )));
        }

        let mut output = String::new();
        let mut last = start;
        for (idx, line) in content.lines().enumerate().skip(start - 1).take(limit) {
            last = idx + 1;
            output.push_str(&format!("{:>6}\t{}\n", last, clip_chars(line, MAX_LINE_LENGTH)));
        }

        if last < total {
            output.push_str(&format!(
                "\n(showing lines {}-{} of {}; use offset {} to continue)",
                start,
                last,
                total,
                last + 1
            ));
        }

        Ok(ToolOutput::success(output).with_metadata(json!({
            "path": ctx.display_path(&path),
            "total_lines": total,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::builtin::test_support::workspace;

    #[tokio::test]
    async fn test_read_numbers_lines() {
        let (dir, ctx) = workspace();
        std::fs::write(dir.path().join("a.txt"), "alpha\nbeta\n").unwrap();

        let output = ReadTool.execute(&json!({"path": "a.txt"}), &ctx).await.unwrap();
        assert!(!output.is_error);
        assert_eq!(output.content, "     1\talpha\n     2\tbeta\n");
    }

    #[tokio::test]
    async fn test_read_offset_and_limit() {
        let (dir, ctx) = workspace();
        let body: String = (1..=10).map(|i| format!("line {}\n", i)).collect();
        std::fs::write(dir.path().join("n.txt"), body).unwrap();

        let output = ReadTool
            .execute(&json!({"path": "n.txt", "offset": 4, "limit": 2}), &ctx)
            .await
            .unwrap();
        assert!(output.content.starts_with("     4\tline 4\n     5\tline 5\n"));
        assert!(output.content.contains("showing lines 4-5 of 10; use offset 6"));
    }

    #[tokio::test]
    async fn test_read_clips_long_lines() {
        let (dir, ctx) = workspace();
        std::fs::write(dir.path().join("long.txt"), "y".repeat(MAX_LINE_LENGTH + 50)).unwrap();

        let output = ReadTool.execute(&json!({"path": "long.txt"}), &ctx).await.unwrap();
        assert!(output.content.contains(&format!("{}...", "y".repeat(MAX_LINE_LENGTH))));
        assert!(!output.content.contains(&"y".repeat(MAX_LINE_LENGTH + 1)));
    }

    #[tokio::test]
    async fn test_read_rejects_binary_and_dirs() {
        let (dir, ctx) = workspace();
        std::fs::write(dir.path().join("bin"), [0u8, 1, 2, 3]).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        assert!(ReadTool.execute(&json!({"path": "bin"}), &ctx).await.unwrap().is_error);
        assert!(ReadTool.execute(&json!({"path": "sub"}), &ctx).await.unwrap().is_error);
    }

    #[tokio::test]
    async fn test_read_missing_file_fails() {
        let (_dir, ctx) = workspace();
        let err = ReadTool.execute(&json!({"path": "nope.txt"}), &ctx).await.unwrap_err();
        assert!(matches!(err, CodeError::Tool { .. }));
    }

    #[tokio::test]
    async fn test_read_outside_workspace() {
        let (_dir, ctx) = workspace();
        let err = ReadTool.execute(&json!({"path": "/etc/hosts"}), &ctx).await;
        assert!(err.is_err());
    }
}
