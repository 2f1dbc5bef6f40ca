//! OpenAI Chat Completions client (also used for OpenAI-compatible servers)

use std::collections::BTreeMap;

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

/// OpenAI client
pub struct OpenAiClient {
    api_key: SecretString,
    model: String,
    base_url: String,
    max_tokens: Option<usize>,
    client: reqwest::Client,
    retry_config: RetryConfig,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<SecretString>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: "https://api.openai.com".to_string(),
            max_tokens: None,
            client: reqwest::Client::new(),
            retry_config: RetryConfig::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl AsRef<str>) -> Self {
        self.base_url = normalize_base_url(base_url.as_ref());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    fn build_request(&self, request: &ChatRequest<'_>) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.extend(convert_messages(&request.wire_messages()));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });

        if let Some(max_tokens) = self.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        if !request.tools.is_empty() {
            body["tools"] = json!(convert_tools(request.tools));
        }

        body
    }
}

/// Convert history to Chat Completions messages.
///
/// Each tool result becomes its own `tool` message; assistant tool calls carry
/// their original argument string.
pub(crate) fn convert_messages(messages: &[Message]) -> Vec<Value> {
    let mut wire = Vec::new();

    for msg in messages {
        match msg.role {
            Role::User => wire.push(json!({"role": "user", "content": msg.text()})),
            Role::Assistant => {
                let tool_calls: Vec<Value> = msg
                    .parts
                    .iter()
                    .filter_map(|part| match part {
                        Part::ToolCall {
                            id,
                            name,
                            input,
                            ..
                        } => {
                            // Must be valid JSON; malformed calls replay as `{}`
                            let arguments = if input.is_object() {
                                input.to_string()
                            } else {
                                "{}".to_string()
                            };
                            Some(json!({
                                "id": id,
                                "type": "function",
                                "function": {"name": name, "arguments": arguments},
                            }))
                        }
                        _ => None,
                    })
                    .collect();
                let text = msg.text();
                if tool_calls.is_empty() && text.is_empty() {
                    continue;
                }
                let mut entry = json!({"role": "assistant", "content": text});
                if !tool_calls.is_empty() {
                    entry["tool_calls"] = json!(tool_calls);
                }
                wire.push(entry);
            }
            Role::Tool => {
                for part in &msg.parts {
                    if let Part::ToolResult {
                        call_id, content, ..
                    } = part
                    {
                        wire.push(json!({
                            "role": "tool",
                            "tool_call_id": call_id,
                            "content": content,
                        }));
                    }
                }
            }
        }
    }

    wire
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            })
        })
        .collect()
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn provider(&self) -> &str {
        "openai"
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
        let url = format!("{}/v1/chat/completions", self.base_url);
        tracing::debug!(url = %url, model = %self.model, "Sending OpenAI streaming request");

        let response = send_with_retry(&self.retry_config, &cancel, || {
            self.client
                .post(url.as_str())
                .header(
                    "Authorization",
                    format!("Bearer {}", self.api_key.expose()),
                )
                .json(&body)
        })
        .await?;

        Ok(spawn_sse_stream(
            response,
            OpenAiStreamParser::default(),
            cancel,
        ))
    }
}

/// Translates Chat Completions chunks into [`StreamEvent`]s
#[derive(Debug, Default)]
pub(crate) struct OpenAiStreamParser {
    /// In-flight tool calls by stream index
    tools: BTreeMap<usize, ToolCallAccumulator>,
    finish_reason: Option<String>,
    done: bool,
}

impl OpenAiStreamParser {
    fn handle(&mut self, chunk: OpenAiStreamChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if let Some(usage) = chunk.usage {
            events.push(StreamEvent::Usage(TokenUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            }));
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return events;
        };

        if let Some(delta) = choice.delta {
            if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                events.push(StreamEvent::TextDelta(content));
            }

            for tc in delta.tool_calls.unwrap_or_default() {
                let acc = self.tools.entry(tc.index).or_default();
                if let Some(id) = tc.id {
                    acc.set_id(id);
                }
                if let Some(func) = tc.function {
                    if let Some(name) = func.name.filter(|n| !n.is_empty()) {
                        acc.set_name(name.clone());
                        events.push(StreamEvent::ToolCallStart {
                            id: acc.id().to_string(),
                            name,
                        });
                    }
                    if let Some(args) = func.arguments.filter(|a| !a.is_empty()) {
                        acc.push(&args);
                        events.push(StreamEvent::ToolCallArgsDelta {
                            id: acc.id().to_string(),
                            fragment: args,
                        });
                    }
                }
            }
        }

        if let Some(reason) = choice.finish_reason {
            // Tool calls are complete once the choice finishes
            events.extend(self.drain_tools());
            self.finish_reason = Some(reason);
        }

        events
    }

    fn drain_tools(&mut self) -> Vec<StreamEvent> {
        std::mem::take(&mut self.tools)
            .into_values()
            .map(|acc| StreamEvent::ToolCallComplete(acc.finish()))
            .collect()
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        self.done = true;
        let mut events = self.drain_tools();
        let reason = match self.finish_reason.as_deref() {
            Some(reason) => FinishReason::from_openai(reason),
            None => {
                return vec![StreamEvent::Done {
                    reason: FinishReason::Error,
                    detail: Some("stream ended without finish_reason".to_string()),
                }]
            }
        };
        events.push(StreamEvent::Done {
            reason,
            detail: self.finish_reason.take(),
        });
        events
    }
}

impl StreamParser for OpenAiStreamParser {
    fn on_event(&mut self, event: SseEvent) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        if event.data.trim() == "[DONE]" {
            return self.finish();
        }
        match serde_json::from_str::<OpenAiStreamChunk>(&event.data) {
            Ok(chunk) => self.handle(chunk),
            Err(e) => {
                // Some compatible servers report failures as a bare error object
                if let Ok(err) = serde_json::from_str::<OpenAiErrorEnvelope>(&event.data) {
                    self.done = true;
                    return vec![StreamEvent::Done {
                        reason: FinishReason::Error,
                        detail: Some(err.error.message),
                    }];
                }
                tracing::debug!(error = %e, data = %event.data, "Skipping unrecognized OpenAI chunk");
                Vec::new()
            }
        }
    }

    fn on_end(&mut self) -> Vec<StreamEvent> {
        self.finish()
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

// OpenAI streaming types
#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: Option<OpenAiDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCallDelta {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<OpenAiFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: usize,
    completion_tokens: usize,
    total_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorEnvelope {
    error: OpenAiErrorBody,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorBody {
    message: String,
}
