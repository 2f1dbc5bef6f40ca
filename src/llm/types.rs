use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool definition advertised to the model
pub type ToolDefinition = a3s_tools_core::ToolSchema;

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    /// Carries tool results back to the model
    Tool,
}

/// One typed piece of a message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        /// Parsed arguments, `null` when the streamed arguments were malformed
        input: Value,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        raw_input: String,
    },
    ToolResult {
        call_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

/// Why the model ended a round-trip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Model ended its turn normally
    Stop,
    /// Model is waiting on tool results
    ToolUse,
    /// Context or output token limit hit
    Length,
    Error,
}

impl FinishReason {
    /// Map an Anthropic `stop_reason`
    pub fn from_anthropic(reason: &str) -> Self {
        match reason {
            "end_turn" | "stop_sequence" => Self::Stop,
            "tool_use" => Self::ToolUse,
            "max_tokens" => Self::Length,
            _ => Self::Error,
        }
    }

    /// Map an OpenAI `finish_reason`
    pub fn from_openai(reason: &str) -> Self {
        match reason {
            "stop" => Self::Stop,
            "tool_calls" | "function_call" => Self::ToolUse,
            "length" => Self::Length,
            _ => Self::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::ToolUse => "tool_use",
            Self::Length => "length",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A conversation message owned by a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub parts: Vec<Part>,
    /// Set on assistant messages whose round-trip finished; `None` means the
    /// message was cut short
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            parts,
            finish_reason: None,
            created_at: Utc::now(),
        }
    }

    pub fn user(text: &str) -> Self {
        Self::new(
            Role::User,
            vec![Part::Text {
                text: text.to_string(),
            }],
        )
    }

    /// Empty assistant message to be filled while streaming
    pub fn assistant() -> Self {
        Self::new(Role::Assistant, Vec::new())
    }

    pub fn tool_results(results: Vec<Part>) -> Self {
        Self::new(Role::Tool, results)
    }

    /// Append streamed text, extending the trailing text part if there is one
    pub fn push_text(&mut self, delta: &str) {
        if let Some(Part::Text { text }) = self.parts.last_mut() {
            text.push_str(delta);
        } else {
            self.parts.push(Part::Text {
                text: delta.to_string(),
            });
        }
    }

    /// Concatenated text parts
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_call_ids(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::ToolCall { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::ToolResult { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.iter().all(|part| match part {
            Part::Text { text } => text.is_empty(),
            _ => false,
        })
    }
}

/// Token usage for one round-trip or accumulated over a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl TokenUsage {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Arguments of a completed tool call
#[derive(Debug, Clone, PartialEq)]
pub enum ToolArguments {
    Parsed(Value),
    /// The streamed fragments never formed a JSON object
    Malformed { error: String },
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub raw_arguments: String,
    pub arguments: ToolArguments,
}

impl ToolCall {
    /// Call with already-parsed arguments
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            raw_arguments: args.to_string(),
            arguments: ToolArguments::Parsed(args),
        }
    }

    /// The message part recording this call in history
    pub fn to_part(&self) -> Part {
        let input = match &self.arguments {
            ToolArguments::Parsed(value) => value.clone(),
            ToolArguments::Malformed { .. } => Value::Null,
        };
        Part::ToolCall {
            id: self.id.clone(),
            name: self.name.clone(),
            input,
            raw_input: self.raw_arguments.clone(),
        }
    }
}

/// Uniform provider event
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ToolCallStart { id: String, name: String },
    ToolCallArgsDelta { id: String, fragment: String },
    ToolCallComplete(ToolCall),
    Usage(TokenUsage),
    /// Always the last event of a stream
    Done {
        reason: FinishReason,
        /// Upstream reason or error message, verbatim
        detail: Option<String>,
    },
}
