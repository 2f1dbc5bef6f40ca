use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::parse_input;
use crate::error::{CodeError, Result};
use crate::tools::{Tool, ToolContext, ToolOutput};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP GET a URL and return its text body
pub struct FetchTool {
    client: reqwest::Client,
}

impl FetchTool {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(concat!("a3s-code/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self { client }
    }
}

impl Default for FetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct FetchInput {
    url: String,
}

/// Only textual bodies are returned to the model
fn is_textual(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    mime.is_empty()
        || mime.starts_with("text/")
        || mime.ends_with("json")
        || mime.ends_with("xml")
        || mime.ends_with("javascript")
        || mime.ends_with("yaml")
}

#[async_trait]
impl Tool for FetchTool {
    fn name(&self) -> &str {
        "fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL over HTTP(S) with GET and return the response body as text. Binary content is refused."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "Absolute http:// or https:// URL"
                }
            },
            "required": ["url"]
        })
    }

    fn summarize(&self, args: &Value) -> String {
        format!("Fetch {}", args["url"].as_str().unwrap_or("?"))
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let input: FetchInput = parse_input(self.name(), args)?;
        let url = reqwest::Url::parse(&input.url).map_err(|e| CodeError::InvalidArguments {
            tool: self.name().to_string(),
            reason: format!("invalid url: {}", e),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CodeError::InvalidArguments {
                tool: self.name().to_string(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        let tool_error = |message: String| CodeError::Tool {
            tool: "fetch".to_string(),
            message,
        };

        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(CodeError::Cancelled),
            resp = self.client.get(url.clone()).send() => {
                resp.map_err(|e| tool_error(format!("request failed: {}", e)))?
            }
        };

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if !is_textual(&content_type) {
            return Ok(ToolOutput::error(format!(
                "Refusing non-text content ({}) from {}",
                content_type, url
            )));
        }

        let body = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(CodeError::Cancelled),
            body = response.text() => body.map_err(|e| tool_error(format!("failed to read body: {}", e)))?,
        };

        let metadata = json!({ "status": status.as_u16(), "content_type": content_type });
        if status.is_success() {
            Ok(ToolOutput::success(body).with_metadata(metadata))
        } else {
            Ok(ToolOutput::error(format!("HTTP {}\n\n{}", status, body)).with_metadata(metadata))
        }
    }
}
