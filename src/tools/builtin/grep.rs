use async_trait::async_trait;
use ignore::WalkBuilder;
use regex::RegexBuilder;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{blocking, clip_chars, parse_input};
use crate::error::{CodeError, Result};
use crate::tools::{Tool, ToolContext, ToolOutput, MAX_GREP_MATCHES};

/// Matched lines are clipped to this many characters
const MAX_MATCH_LINE: usize = 300;

/// Regex search over workspace files
pub struct GrepTool;

#[derive(Debug, Deserialize)]
struct GrepInput {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
    /// File-name glob, e.g. `*.rs`
    #[serde(default)]
    include: Option<String>,
    #[serde(default)]
    case_insensitive: bool,
}

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents with a regular expression. Returns matching lines as path:line:text. Ignored files (.gitignore) are skipped."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for"
                },
                "path": {
                    "type": "string",
                    "description": "File or directory to search, relative to the workspace. Default: workspace root"
                },
                "include": {
                    "type": "string",
                    "description": "Only search files whose name matches this glob, e.g. '*.rs'"
                },
                "case_insensitive": {
                    "type": "boolean",
                    "description": "Case insensitive search. Default: false"
                }
            },
            "required": ["pattern"]
        })
    }

    fn requires_permission(&self) -> bool {
        false
    }

    fn summarize(&self, args: &Value) -> String {
        format!("Search for /{}/", args["pattern"].as_str().unwrap_or("?"))
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let input: GrepInput = parse_input(self.name(), args)?;
        let invalid = |reason: String| CodeError::InvalidArguments {
            tool: "grep".to_string(),
            reason,
        };

        let regex = RegexBuilder::new(&input.pattern)
            .case_insensitive(input.case_insensitive)
            .build()
            .map_err(|e| invalid(format!("invalid regex: {}", e)))?;
        let include = input
            .include
            .as_deref()
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| invalid(format!("invalid include glob: {}", e)))?;

        let root = ctx.resolve_path(self.name(), input.path.as_deref().unwrap_or("."))?;
        let workspace = ctx.workspace.clone();
        let cancel = ctx.cancel.clone();

        let (matches, truncated) = blocking(self.name(), move || {
            let mut matches = Vec::new();
            let walker = WalkBuilder::new(&root)
                .hidden(false)
                .require_git(false)
                .filter_entry(|e| e.file_name() != ".git")
                .build();

            for entry in walker.filter_map(|e| e.ok()) {
                if cancel.is_cancelled() {
                    return Err(CodeError::Cancelled);
                }
                if !entry.file_type().is_some_and(|t| t.is_file()) {
                    continue;
                }
                if let Some(include) = &include {
                    if !include.matches(&entry.file_name().to_string_lossy()) {
                        continue;
                    }
                }
                // Unreadable or non-UTF-8 files are skipped
                let Ok(content) = std::fs::read_to_string(entry.path()) else {
                    continue;
                };
                let display = entry
                    .path()
                    .strip_prefix(&workspace)
                    .unwrap_or(entry.path())
                    .display()
                    .to_string();
                for (idx, line) in content.lines().enumerate() {
                    if regex.is_match(line) {
                        if matches.len() == MAX_GREP_MATCHES {
                            return Ok((matches, true));
                        }
                        matches.push(format!(
                            "{}:{}:{}",
                            display,
                            idx + 1,
                            clip_chars(line.trim_end(), MAX_MATCH_LINE)
                        ));
                    }
                }
            }
            Ok((matches, false))
        })
        .await?;

        if matches.is_empty() {
            return Ok(ToolOutput::success(format!(
                "No matches found for pattern '{}'",
                input.pattern
            )));
        }

        let mut output = matches.join("\n");
        if truncated {
            output.push_str(&format!(
                "\n\n(results truncated at {} matches; narrow the pattern or path)",
                MAX_GREP_MATCHES
            ));
        }
        Ok(ToolOutput::success(output).with_metadata(json!({
            "matches": matches.len(),
            "truncated": truncated,
        })))
    }
}
