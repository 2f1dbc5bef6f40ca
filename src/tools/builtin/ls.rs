use async_trait::async_trait;
use ignore::WalkBuilder;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{blocking, parse_input};
use crate::error::{CodeError, Result};
use crate::tools::{Tool, ToolContext, ToolOutput, MAX_GLOB_RESULTS};

/// List a directory, honouring `.gitignore`
pub struct LsTool;

#[derive(Debug, Deserialize)]
struct LsInput {
    #[serde(default)]
    path: Option<String>,
}

#[async_trait]
impl Tool for LsTool {
    fn name(&self) -> &str {
        "ls"
    }

    fn description(&self) -> &str {
        "List the entries of a directory in the workspace. Directories end with '/'. Ignored files (.gitignore) are skipped."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory path, relative to the workspace. Default: workspace root"
                }
            }
        })
    }

    fn requires_permission(&self) -> bool {
        false
    }

    fn summarize(&self, args: &Value) -> String {
        format!("List {}", args["path"].as_str().unwrap_or("."))
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let input: LsInput = parse_input(self.name(), args)?;
        let requested = input.path.unwrap_or_else(|| ".".to_string());
        let dir = ctx.resolve_path(self.name(), &requested)?;

        if !dir.is_dir() {
            return Ok(ToolOutput::error(format!("'{}' is not a directory", requested)));
        }

        let tool = self.name().to_string();
        let walk_dir = dir.clone();
        let mut entries = blocking(self.name(), move || {
            let mut entries = Vec::new();
            let walker = WalkBuilder::new(&walk_dir)
                .max_depth(Some(1))
                .hidden(false)
                .require_git(false)
                .filter_entry(|e| e.file_name() != ".git")
                .build();
            for entry in walker {
                let entry = entry.map_err(|e| CodeError::Tool {
                    tool: tool.clone(),
                    message: e.to_string(),
                })?;
                if entry.depth() == 0 {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
                entries.push(if is_dir { format!("{}/", name) } else { name });
            }
            Ok(entries)
        })
        .await?;

        if entries.is_empty() {
            return Ok(ToolOutput::success("(empty directory)"));
        }

        entries.sort();
        let total = entries.len();
        entries.truncate(MAX_GLOB_RESULTS);
        let mut output = entries.join("\n");
        if total > MAX_GLOB_RESULTS {
            output.push_str(&format!(
                "\n\n({} more entries not shown)",
                total - MAX_GLOB_RESULTS
            ));
        }
        Ok(ToolOutput::success(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::builtin::test_support::workspace;

    #[tokio::test]
    async fn test_ls_lists_sorted_with_dir_suffix() {
        let (dir, ctx) = workspace();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        std::fs::write(dir.path().join("a.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "").unwrap();

        let output = LsTool.execute(&json!({}), &ctx).await.unwrap();
        assert_eq!(output.content, "a.txt\nb.txt\nsrc/");

        let output = LsTool.execute(&json!({"path": "src"}), &ctx).await.unwrap();
        assert_eq!(output.content, "lib.rs");
    }

    #[tokio::test]
    async fn test_ls_honours_gitignore() {
        let (dir, ctx) = workspace();
        std::fs::write(dir.path().join(".gitignore"), "target/\n*.log\n").unwrap();
        std::fs::create_dir(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join("debug.log"), "").unwrap();
        std::fs::write(dir.path().join("keep.rs"), "").unwrap();

        let output = LsTool.execute(&json!({}), &ctx).await.unwrap();
        assert!(output.content.contains("keep.rs"));
        assert!(output.content.contains(".gitignore"));
        assert!(!output.content.contains("target"));
        assert!(!output.content.contains("debug.log"));
    }

    #[tokio::test]
    async fn test_ls_errors() {
        let (dir, ctx) = workspace();
        std::fs::write(dir.path().join("f"), "").unwrap();
        assert!(LsTool.execute(&json!({"path": "f"}), &ctx).await.unwrap().is_error);

        std::fs::create_dir(dir.path().join("empty")).unwrap();
        let output = LsTool.execute(&json!({"path": "empty"}), &ctx).await.unwrap();
        assert_eq!(output.content, "(empty directory)");
    }
}
