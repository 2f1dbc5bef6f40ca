//! Retry logic for provider requests
//!
//! Exponential backoff with jitter for transient failures: connection errors
//! and the retryable HTTP statuses below. `Retry-After` takes precedence over
//! the computed backoff when the provider sends it.
//!
//! ## Retryable Status Codes
//!
//! - 429: Too Many Requests (rate limited)
//! - 500: Internal Server Error
//! - 502: Bad Gateway
//! - 503: Service Unavailable
//! - 529: Overloaded (Anthropic-specific)

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{CodeError, ProviderErrorKind, Result};

/// Configuration for provider retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries)
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential growth)
    pub max_delay_ms: u64,
    /// HTTP status codes that trigger a retry
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            retryable_status_codes: vec![429, 500, 502, 503, 529],
        }
    }
}

impl RetryConfig {
    /// Create a retry config with no retries (disabled)
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }

    /// Delay before retry number `attempt` (0-indexed).
    ///
    /// `base_delay * 2^attempt`, capped at `max_delay`, with ±25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp_delay = self.base_delay_ms.saturating_mul(1u64 << attempt.min(10));
        let capped = exp_delay.min(self.max_delay_ms);

        let jitter_range = capped / 4;
        let delay = if jitter_range > 0 {
            let offset = (attempt as u64 * 7 + 3) % (jitter_range * 2 + 1);
            capped - jitter_range + offset
        } else {
            capped
        };

        Duration::from_millis(delay)
    }

    /// Parse a `Retry-After` header given in (possibly fractional) seconds.
    ///
    /// Values outside (0, 300] are ignored.
    pub fn parse_retry_after(header_value: Option<&str>) -> Option<Duration> {
        let seconds = header_value?.trim().parse::<f64>().ok()?;
        if seconds > 0.0 && seconds <= 300.0 {
            Some(Duration::from_secs_f64(seconds))
        } else {
            None
        }
    }
}

/// Outcome of a single attempt, used by the retry loop
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    Success(T),
    /// Transient failure; `status` is `None` for connection-level errors
    Retryable {
        status: Option<u16>,
        body: String,
        retry_after: Option<Duration>,
    },
    /// Non-retryable failure, returned immediately
    Fatal(CodeError),
}

/// Run `operation` until it succeeds, fails fatally, or retries run out.
///
/// Backoff sleeps are interrupted by `cancel`, which yields `Cancelled`.
/// Exhaustion yields a `Provider` error carrying the last status.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation: F,
) -> Result<T>
where
    F: Fn(u32) -> Fut,
    Fut: std::future::Future<Output = AttemptOutcome<T>>,
{
    let mut last_status = None;
    let mut last_body = String::new();

    for attempt in 0..=config.max_retries {
        if cancel.is_cancelled() {
            return Err(CodeError::Cancelled);
        }

        match operation(attempt).await {
            AttemptOutcome::Success(value) => {
                if attempt > 0 {
                    tracing::info!(retries = attempt, "Provider request succeeded after retry");
                }
                return Ok(value);
            }
            AttemptOutcome::Fatal(err) => return Err(err),
            AttemptOutcome::Retryable {
                status,
                body,
                retry_after,
            } => {
                last_status = status;
                last_body = body;

                if attempt < config.max_retries {
                    let delay = retry_after.unwrap_or_else(|| config.delay_for_attempt(attempt));
                    tracing::warn!(
                        status = ?status,
                        attempt = attempt + 1,
                        max_attempts = config.max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Provider request failed, retrying"
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(CodeError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    let kind = last_status
        .map(ProviderErrorKind::from_status)
        .unwrap_or(ProviderErrorKind::Connection);
    Err(CodeError::Provider {
        status: last_status,
        kind,
        message: format!(
            "request failed after {} attempts: {}",
            config.max_retries + 1,
            last_body
        ),
    })
}
