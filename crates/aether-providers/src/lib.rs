// LLM provider implementations
//
// Two HTTP providers behind the kernel's LlmProvider trait: an
// OpenAI-compatible chat-completions client and an Anthropic messages client.
// Both are non-streaming (the loop consumes one reply per step), retry
// transient failures with exponential backoff, and abort promptly on
// cancellation.

use std::time::Duration;

use aether_core::{KernelError, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

/// Per-attempt request timeout
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Backoff schedule after failed attempts (3 retries total)
pub(crate) const BACKOFF: [Duration; 3] = [
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
];

/// Transient statuses worth retrying
pub(crate) fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 429 || status.is_server_error()
}

/// Issue a request built by `build`, retrying transient failures.
///
/// Returns the first non-retryable response, or the last error once the
/// backoff schedule is exhausted. Honors the cancellation token between
/// attempts and while a request is in flight.
pub(crate) async fn send_with_retries<F>(
    build: F,
    cancel: &CancellationToken,
) -> Result<reqwest::Response>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut last_error = None;
    for attempt in 0..=BACKOFF.len() {
        if cancel.is_cancelled() {
            return Err(KernelError::Cancelled);
        }
        let outcome = tokio::select! {
            result = build().send() => result,
            _ = cancel.cancelled() => return Err(KernelError::Cancelled),
        };
        match outcome {
            Ok(response) if !is_retryable_status(response.status()) => return Ok(response),
            Ok(response) => {
                last_error = Some(KernelError::llm(format!(
                    "provider returned {}",
                    response.status()
                )));
            }
            Err(e) => {
                last_error = Some(KernelError::llm(e.to_string()));
            }
        }
        if attempt < BACKOFF.len() {
            debug!(attempt = attempt + 1, "retrying llm call");
            tokio::select! {
                _ = tokio::time::sleep(BACKOFF[attempt]) => {}
                _ = cancel.cancelled() => return Err(KernelError::Cancelled),
            }
        }
    }
    Err(last_error.unwrap_or_else(|| KernelError::llm("retry budget exhausted")))
}
