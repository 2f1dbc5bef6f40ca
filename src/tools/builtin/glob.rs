use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{blocking, parse_input};
use crate::error::{CodeError, Result};
use crate::tools::{Tool, ToolContext, ToolOutput, MAX_GLOB_RESULTS};

/// Find files by glob pattern
pub struct GlobTool;

#[derive(Debug, Deserialize)]
struct GlobInput {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
}

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Find files matching a glob pattern such as '**/*.rs'. Patterns are relative to the workspace or to the optional base path."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern, e.g. 'src/**/*.rs'"
                },
                "path": {
                    "type": "string",
                    "description": "Base directory, relative to the workspace. Default: workspace root"
                }
            },
            "required": ["pattern"]
        })
    }

    fn requires_permission(&self) -> bool {
        false
    }

    fn summarize(&self, args: &Value) -> String {
        format!("Glob {}", args["pattern"].as_str().unwrap_or("?"))
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let input: GlobInput = parse_input(self.name(), args)?;

        if input.pattern.starts_with('/') || input.pattern.split('/').any(|c| c == "..") {
            return Err(CodeError::InvalidArguments {
                tool: self.name().to_string(),
                reason: "pattern must be relative and may not contain '..'".to_string(),
            });
        }

        let base = ctx.resolve_path(self.name(), input.path.as_deref().unwrap_or("."))?;
        let full_pattern = format!(
            "{}/{}",
            glob::Pattern::escape(&base.to_string_lossy()),
            input.pattern
        );

        let tool = self.name().to_string();
        let workspace = ctx.workspace.clone();
        let mut matches = blocking(self.name(), move || {
            let paths = glob::glob(&full_pattern).map_err(|e| CodeError::InvalidArguments {
                tool: tool.clone(),
                reason: format!("invalid glob pattern: {}", e),
            })?;
            Ok(paths
                .filter_map(|entry| entry.ok())
                .filter(|path| path.is_file() && path.starts_with(&workspace))
                .collect::<Vec<_>>())
        })
        .await?;

        if matches.is_empty() {
            return Ok(ToolOutput::success(format!(
                "No files found matching '{}'",
                input.pattern
            )));
        }

        matches.sort();
        let total = matches.len();
        let mut output = matches
            .iter()
            .take(MAX_GLOB_RESULTS)
            .map(|p| ctx.display_path(p))
            .collect::<Vec<_>>()
            .join("\n");
        if total > MAX_GLOB_RESULTS {
            output.push_str(&format!(
                "\n\n(results truncated: showing {} of {} files)",
                MAX_GLOB_RESULTS, total
            ));
        }
        Ok(ToolOutput::success(output).with_metadata(json!({ "count": total })))
    }
}
