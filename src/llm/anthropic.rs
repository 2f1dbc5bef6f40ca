//! Anthropic Messages API client

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::accumulator::ToolCallAccumulator;
use super::sse::{spawn_sse_stream, SseEvent, StreamParser};
use super::types::{FinishReason, Message, Part, Role, StreamEvent, TokenUsage, ToolDefinition};
use super::{normalize_base_url, send_with_retry, ChatRequest, LlmClient, SecretString};
use crate::error::Result;
use crate::retry::RetryConfig;

/// Default max tokens for model responses
pub const DEFAULT_MAX_TOKENS: usize = 8192;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Claude client
pub struct AnthropicClient {
    api_key: SecretString,
    model: String,
    base_url: String,
    max_tokens: usize,
    client: reqwest::Client,
    retry_config: RetryConfig,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<SecretString>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            client: reqwest::Client::new(),
            retry_config: RetryConfig::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl AsRef<str>) -> Self {
        self.base_url = normalize_base_url(base_url.as_ref());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    fn build_request(&self, request: &ChatRequest<'_>) -> Value {
        let messages = request.wire_messages();
        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": convert_messages(&messages),
            "stream": true,
        });

        if let Some(system) = request.system {
            body["system"] = json!(system);
        }

        if !request.tools.is_empty() {
            body["tools"] = json!(convert_tools(request.tools));
        }

        body
    }
}

/// Convert history to Anthropic wire messages.
///
/// Tool results travel as `user` messages; consecutive messages with the same
/// wire role are merged and empty messages are dropped.
pub(crate) fn convert_messages(messages: &[Message]) -> Vec<Value> {
    let mut wire: Vec<(String, Vec<Value>)> = Vec::new();

    for msg in messages {
        let role = match msg.role {
            Role::Assistant => "assistant",
            Role::User | Role::Tool => "user",
        };
        let blocks: Vec<Value> = msg
            .parts
            .iter()
            .filter_map(|part| match part {
                Part::Text { text } if text.is_empty() => None,
                Part::Text { text } => Some(json!({"type": "text", "text": text})),
                Part::ToolCall {
                    id, name, input, ..
                } => {
                    let input = if input.is_object() {
                        input.clone()
                    } else {
                        json!({})
                    };
                    Some(json!({"type": "tool_use", "id": id, "name": name, "input": input}))
                }
                Part::ToolResult {
                    call_id,
                    content,
                    is_error,
                } => Some(json!({
                    "type": "tool_result",
                    "tool_use_id": call_id,
                    "content": content,
                    "is_error": is_error,
                })),
            })
            .collect();

        if blocks.is_empty() {
            continue;
        }
        match wire.last_mut() {
            Some((last_role, last_blocks)) if last_role == role => last_blocks.extend(blocks),
            _ => wire.push((role.to_string(), blocks)),
        }
    }

    wire.into_iter()
        .map(|(role, content)| json!({"role": role, "content": content}))
        .collect()
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.parameters,
            })
        })
        .collect()
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn provider(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn stream(
        &self,
        request: ChatRequest<'_>,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        let body = self.build_request(&request);
        let url = format!("{}/v1/messages", self.base_url);
        tracing::debug!(url = %url, model = %self.model, "Sending Anthropic streaming request");

        let response = send_with_retry(&self.retry_config, &cancel, || {
            self.client
                .post(url.as_str())
                .header("x-api-key", self.api_key.expose())
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
        })
        .await?;

        Ok(spawn_sse_stream(
            response,
            AnthropicStreamParser::default(),
            cancel,
        ))
    }
}

/// Translates Anthropic stream events into [`StreamEvent`]s
#[derive(Debug, Default)]
pub(crate) struct AnthropicStreamParser {
    /// In-flight tool calls by content block index
    tools: HashMap<usize, ToolCallAccumulator>,
    usage: TokenUsage,
    stop_reason: Option<String>,
    done: bool,
}

impl AnthropicStreamParser {
    fn handle(&mut self, event: AnthropicStreamEvent) -> Vec<StreamEvent> {
        match event {
            AnthropicStreamEvent::MessageStart { message } => {
                self.usage.prompt_tokens = message.usage.input_tokens
                    + message.usage.cache_read_input_tokens.unwrap_or(0)
                    + message.usage.cache_creation_input_tokens.unwrap_or(0);
                Vec::new()
            }
            AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                AnthropicContentBlock::Text { text } if !text.is_empty() => {
                    vec![StreamEvent::TextDelta(text)]
                }
                AnthropicContentBlock::ToolUse { id, name } => {
                    self.tools
                        .insert(index, ToolCallAccumulator::new(id.clone(), name.clone()));
                    vec![StreamEvent::ToolCallStart { id, name }]
                }
                _ => Vec::new(),
            },
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => match delta {
                AnthropicDelta::TextDelta { text } => vec![StreamEvent::TextDelta(text)],
                AnthropicDelta::InputJsonDelta { partial_json } => {
                    match self.tools.get_mut(&index) {
                        Some(acc) => {
                            acc.push(&partial_json);
                            vec![StreamEvent::ToolCallArgsDelta {
                                id: acc.id().to_string(),
                                fragment: partial_json,
                            }]
                        }
                        None => {
                            tracing::warn!(index, "input_json_delta for unknown content block");
                            Vec::new()
                        }
                    }
                }
                AnthropicDelta::Other => Vec::new(),
            },
            AnthropicStreamEvent::ContentBlockStop { index } => self
                .tools
                .remove(&index)
                .map(|acc| vec![StreamEvent::ToolCallComplete(acc.finish())])
                .unwrap_or_default(),
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
                self.usage.completion_tokens = usage.output_tokens;
                self.usage.total_tokens = self.usage.prompt_tokens + usage.output_tokens;
                vec![StreamEvent::Usage(self.usage)]
            }
            AnthropicStreamEvent::MessageStop => {
                self.done = true;
                let mut events = self.drain_tools();
                let reason = self
                    .stop_reason
                    .as_deref()
                    .map(FinishReason::from_anthropic)
                    .unwrap_or(FinishReason::Stop);
                events.push(StreamEvent::Done {
                    reason,
                    detail: self.stop_reason.take(),
                });
                events
            }
            AnthropicStreamEvent::Error { error } => {
                self.done = true;
                vec![StreamEvent::Done {
                    reason: FinishReason::Error,
                    detail: Some(format!("{}: {}", error.error_type, error.message)),
                }]
            }
            AnthropicStreamEvent::Ping | AnthropicStreamEvent::Other => Vec::new(),
        }
    }

    /// Complete blocks that never received a stop, ordered by index
    fn drain_tools(&mut self) -> Vec<StreamEvent> {
        let mut pending: Vec<_> = self.tools.drain().collect();
        pending.sort_by_key(|(index, _)| *index);
        pending
            .into_iter()
            .map(|(_, acc)| StreamEvent::ToolCallComplete(acc.finish()))
            .collect()
    }
}

impl StreamParser for AnthropicStreamParser {
    fn on_event(&mut self, event: SseEvent) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        match serde_json::from_str::<AnthropicStreamEvent>(&event.data) {
            Ok(parsed) => self.handle(parsed),
            Err(e) => {
                tracing::debug!(error = %e, data = %event.data, "Skipping unrecognized Anthropic event");
                Vec::new()
            }
        }
    }

    fn on_end(&mut self) -> Vec<StreamEvent> {
        self.done = true;
        vec![StreamEvent::Done {
            reason: FinishReason::Error,
            detail: Some("stream ended before message_stop".to_string()),
        }]
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

// Anthropic streaming event types
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamEvent {
    MessageStart {
        message: AnthropicMessageStart,
    },
    ContentBlockStart {
        index: usize,
        content_block: AnthropicContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: AnthropicDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: AnthropicMessageDeltaData,
        usage: AnthropicOutputUsage,
    },
    MessageStop,
    Ping,
    Error {
        error: AnthropicError,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageStart {
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: usize,
    cache_read_input_tokens: Option<usize>,
    cache_creation_input_tokens: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageDeltaData {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicOutputUsage {
    #[serde(default)]
    output_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}
