//! LLM provider adapter
//!
//! Normalizes a chat history and tool catalogue into one streaming round-trip
//! against a provider and yields a uniform [`StreamEvent`] sequence:
//! - Anthropic Claude (Messages API)
//! - OpenAI GPT and OpenAI-compatible servers (Chat Completions API)
//!
//! Features:
//! - Incremental tool-call argument reconstruction
//! - Token usage reporting
//! - Automatic retry with exponential backoff for transient errors

pub mod accumulator;
pub mod anthropic;
pub mod openai;
pub mod sse;
mod types;

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use accumulator::ToolCallAccumulator;
pub use anthropic::AnthropicClient;
pub use openai::OpenAiClient;
pub use types::*;

use crate::error::{CodeError, ProviderErrorKind, Result};
use crate::retry::{with_retry, AttemptOutcome, RetryConfig};

/// A string wrapper that redacts its value in Debug and Display output.
/// Prevents API keys from leaking into logs and error messages.
#[derive(Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Access the secret value (only for HTTP headers)
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Input of one provider round-trip
#[derive(Debug, Clone, Copy)]
pub struct ChatRequest<'a> {
    pub messages: &'a [Message],
    pub tools: &'a [ToolDefinition],
    pub system: Option<&'a str>,
    /// Synthetic reminder appended to the wire history, never persisted
    pub reminder: Option<&'a str>,
}

impl<'a> ChatRequest<'a> {
    /// History as sent to the provider, with the reminder appended
    pub fn wire_messages(&self) -> Cow<'a, [Message]> {
        match self.reminder {
            Some(reminder) => {
                let mut messages = self.messages.to_vec();
                messages.push(Message::user(&crate::prompts::wrap_reminder(reminder)));
                Cow::Owned(messages)
            }
            None => Cow::Borrowed(self.messages),
        }
    }
}

/// Streaming capability shared by every provider
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Provider name used in logs and cost records
    fn provider(&self) -> &str;

    fn model(&self) -> &str;

    /// Start one round-trip.
    ///
    /// Request-level failures (after retries) are returned as errors; once
    /// streaming has begun every outcome is reported in-band and the receiver
    /// yields exactly one [`StreamEvent::Done`].
    async fn stream(
        &self,
        request: ChatRequest<'_>,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>>;
}

/// The closed set of supported providers
pub enum ProviderClient {
    Anthropic(AnthropicClient),
    OpenAi(OpenAiClient),
}

#[async_trait]
impl LlmClient for ProviderClient {
    fn provider(&self) -> &str {
        match self {
            ProviderClient::Anthropic(c) => c.provider(),
            ProviderClient::OpenAi(c) => c.provider(),
        }
    }

    fn model(&self) -> &str {
        match self {
            ProviderClient::Anthropic(c) => c.model(),
            ProviderClient::OpenAi(c) => c.model(),
        }
    }

    async fn stream(
        &self,
        request: ChatRequest<'_>,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        match self {
            ProviderClient::Anthropic(c) => c.stream(request, cancel).await,
            ProviderClient::OpenAi(c) => c.stream(request, cancel).await,
        }
    }
}

// ============================================================================
// HTTP Utilities
// ============================================================================

/// Normalize base URL by stripping trailing /v1
pub(crate) fn normalize_base_url(base_url: &str) -> String {
    base_url
        .trim_end_matches('/')
        .trim_end_matches("/v1")
        .trim_end_matches('/')
        .to_string()
}

/// Send a request built by `build`, retrying transient failures.
pub(crate) async fn send_with_retry<F>(
    retry: &RetryConfig,
    cancel: &CancellationToken,
    build: F,
) -> Result<reqwest::Response>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    with_retry(retry, cancel, |_attempt| {
        let request = build();
        async move {
            let sent = tokio::select! {
                _ = cancel.cancelled() => return AttemptOutcome::Fatal(CodeError::Cancelled),
                sent = request.send() => sent,
            };
            match sent {
                Ok(resp) if resp.status().is_success() => AttemptOutcome::Success(resp),
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let retry_after = RetryConfig::parse_retry_after(
                        resp.headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok()),
                    );
                    let body = resp.text().await.unwrap_or_default();
                    if retry.is_retryable_status(status) {
                        AttemptOutcome::Retryable {
                            status: Some(status),
                            body,
                            retry_after,
                        }
                    } else {
                        AttemptOutcome::Fatal(CodeError::Provider {
                            status: Some(status),
                            kind: ProviderErrorKind::from_status(status),
                            message: body,
                        })
                    }
                }
                Err(e) if e.is_connect() || e.is_timeout() => AttemptOutcome::Retryable {
                    status: None,
                    body: e.to_string(),
                    retry_after: None,
                },
                Err(e) => AttemptOutcome::Fatal(CodeError::Provider {
                    status: None,
                    kind: ProviderErrorKind::Connection,
                    message: e.to_string(),
                }),
            }
        }
    })
    .await
}

// ============================================================================
// Factory
// ============================================================================

/// LLM client configuration
#[derive(Clone, Default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub api_key: SecretString,
    pub base_url: Option<String>,
    pub max_tokens: Option<usize>,
    pub retry_config: Option<RetryConfig>,
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("max_tokens", &self.max_tokens)
            .field("retry_config", &self.retry_config)
            .finish()
    }
}

impl LlmConfig {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            api_key: SecretString::new(api_key.into()),
            ..Default::default()
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = Some(retry_config);
        self
    }
}

/// Build the provider client selected by `config.provider`
pub fn create_provider(config: LlmConfig) -> ProviderClient {
    let retry = config.retry_config.unwrap_or_default();

    match config.provider.as_str() {
        "anthropic" | "claude" => {
            let mut client =
                AnthropicClient::new(config.api_key, config.model).with_retry_config(retry);
            if let Some(base_url) = config.base_url {
                client = client.with_base_url(base_url);
            }
            if let Some(max_tokens) = config.max_tokens {
                client = client.with_max_tokens(max_tokens);
            }
            ProviderClient::Anthropic(client)
        }
        other => {
            if !matches!(other, "openai" | "gpt") {
                tracing::info!(
                    provider = other,
                    "Using OpenAI-compatible client for provider"
                );
            }
            let mut client =
                OpenAiClient::new(config.api_key, config.model).with_retry_config(retry);
            if let Some(base_url) = config.base_url {
                client = client.with_base_url(base_url);
            }
            if let Some(max_tokens) = config.max_tokens {
                client = client.with_max_tokens(max_tokens);
            }
            ProviderClient::OpenAi(client)
        }
    }
}

/// Build a shareable client handle
pub fn create_client(config: LlmConfig) -> Arc<dyn LlmClient> {
    Arc::new(create_provider(config))
}
