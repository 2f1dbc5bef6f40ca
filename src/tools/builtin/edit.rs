use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use similar::TextDiff;

use super::{clip_chars, parse_input};
use crate::error::{CodeError, Result};
use crate::tools::{Tool, ToolContext, ToolOutput};

/// Exact string replacement inside a file
pub struct EditTool;

#[derive(Debug, Deserialize)]
struct EditInput {
    path: String,
    old_string: String,
    new_string: String,
    #[serde(default)]
    replace_all: bool,
}

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing an exact string. old_string must match exactly and uniquely unless replace_all is true. Returns a unified diff of the change."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, relative to the workspace"
                },
                "old_string": {
                    "type": "string",
                    "description": "The exact text to replace"
                },
                "new_string": {
                    "type": "string",
                    "description": "The replacement text"
                },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace every occurrence instead of requiring a unique match. Default: false"
                }
            },
            "required": ["path", "old_string", "new_string"]
        })
    }

    fn summarize(&self, args: &Value) -> String {
        format!("Edit {}", args["path"].as_str().unwrap_or("?"))
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let input: EditInput = parse_input(self.name(), args)?;

        if input.old_string.is_empty() {
            return Err(CodeError::InvalidArguments {
                tool: self.name().to_string(),
                reason: "old_string must not be empty".to_string(),
            });
        }
        if input.old_string == input.new_string {
            return Err(CodeError::InvalidArguments {
                tool: self.name().to_string(),
                reason: "old_string and new_string are identical".to_string(),
            });
        }

        let path = ctx.resolve_path(self.name(), &input.path)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| CodeError::Tool {
                tool: self.name().to_string(),
                message: format!("cannot read '{}': {}", input.path, e),
            })?;

        let count = content.matches(&input.old_string).count();
        if count == 0 {
            return Ok(ToolOutput::error(format!(
                "String not found in '{}': '{}'",
                input.path,
                clip_chars(&input.old_string, 100)
            )));
        }
        if count > 1 && !input.replace_all {
            return Ok(ToolOutput::error(format!(
                "Found {} occurrences of the string in '{}'. Use replace_all: true to replace all, or provide a more specific string.",
                count, input.path
            )));
        }

        let updated = if input.replace_all {
            content.replace(&input.old_string, &input.new_string)
        } else {
            content.replacen(&input.old_string, &input.new_string, 1)
        };
        tokio::fs::write(&path, updated.as_bytes()).await?;

        let display = ctx.display_path(&path);
        let diff = unified_diff(&content, &updated, &display);
        let replaced = if input.replace_all { count } else { 1 };
        Ok(ToolOutput::success(format!(
            "Replaced {} occurrence(s) in {}\n\n{}",
            replaced, display, diff
        ))
        .with_metadata(json!({ "path": display, "replacements": replaced })))
    }
}

fn unified_diff(old: &str, new: &str, path: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{}", path), &format!("b/{}", path))
        .to_string()
}
