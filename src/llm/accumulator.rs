//! Incremental reconstruction of streamed tool-call arguments.
//!
//! Providers stream tool arguments as arbitrary JSON fragments. Fragments are
//! buffered as-is and parsed exactly once, when the provider signals the call
//! is complete.

use super::types::{ToolArguments, ToolCall};

/// Buffers argument fragments for one in-flight tool call
#[derive(Debug, Clone, Default)]
pub struct ToolCallAccumulator {
    id: String,
    name: String,
    buffer: String,
}

impl ToolCallAccumulator {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            buffer: String::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Some providers send the id or name in a later chunk than the first
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn push(&mut self, fragment: &str) {
        self.buffer.push_str(fragment);
    }

    /// Parse the buffered arguments.
    ///
    /// An empty buffer means a call with no arguments. Anything that does not
    /// parse to a JSON object is reported as malformed.
    pub fn finish(self) -> ToolCall {
        let arguments = if self.buffer.trim().is_empty() {
            ToolArguments::Parsed(serde_json::json!({}))
        } else {
            match serde_json::from_str::<serde_json::Value>(&self.buffer) {
                Ok(value) if value.is_object() => ToolArguments::Parsed(value),
                Ok(_) => ToolArguments::Malformed {
                    error: "arguments must be a JSON object".to_string(),
                },
                Err(e) => {
                    tracing::warn!(
                        tool = %self.name,
                        call_id = %self.id,
                        error = %e,
                        "Tool call arguments never became valid JSON"
                    );
                    ToolArguments::Malformed {
                        error: e.to_string(),
                    }
                }
            }
        };

        ToolCall {
            id: self.id,
            name: self.name,
            raw_arguments: self.buffer,
            arguments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fragments_split_mid_token() {
        let mut acc = ToolCallAccumulator::new("call_1", "read");
        for fragment in ["{\"pa", "th\": \"src/ma", "in.rs\", \"lim", "it\": 5}"] {
            acc.push(fragment);
        }
        let call = acc.finish();
        assert_eq!(call.id, "call_1");
        assert_eq!(
            call.arguments,
            ToolArguments::Parsed(json!({"path": "src/main.rs", "limit": 5}))
        );
        assert_eq!(call.raw_arguments, "{\"path\": \"src/main.rs\", \"limit\": 5}");
    }

    #[test]
    fn test_empty_arguments_are_empty_object() {
        let call = ToolCallAccumulator::new("c", "ls").finish();
        assert_eq!(call.arguments, ToolArguments::Parsed(json!({})));

        let mut acc = ToolCallAccumulator::new("c", "ls");
        acc.push("  ");
        assert_eq!(acc.finish().arguments, ToolArguments::Parsed(json!({})));
    }

    #[test]
    fn test_truncated_json_is_malformed() {
        let mut acc = ToolCallAccumulator::new("c", "write");
        acc.push("{\"path\": \"a.txt\", \"content\": \"unterminated");
        match acc.finish().arguments {
            ToolArguments::Malformed { error } => assert!(error.contains("EOF")),
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[test]
    fn test_non_object_is_malformed() {
        let mut acc = ToolCallAccumulator::new("c", "bash");
        acc.push("[1, 2]");
        assert!(matches!(
            acc.finish().arguments,
            ToolArguments::Malformed { .. }
        ));
    }

    #[test]
    fn test_late_id_and_name() {
        let mut acc = ToolCallAccumulator::default();
        acc.set_id("late");
        acc.set_name("grep");
        acc.push("{}");
        let call = acc.finish();
        assert_eq!(call.id, "late");
        assert_eq!(call.name, "grep");
    }
}
