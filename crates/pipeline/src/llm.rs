//! The LLM client port.
//!
//! Provider wire protocols live outside this crate. Every provider implements
//! [`LlmClient`]; the infrastructure layer wraps clients with retry, rate
//! limiting and bounded concurrency without knowing which provider it talks to.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Classify, Retryability, Stage, TemplateId, TokenCount};

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// Supported provider families.
///
/// Adding a provider means adding a variant and registering a constructor with
/// the client factory; the pipeline never branches on provider names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// A local program speaking a line-oriented stdin/stdout protocol.
    #[default]
    Command,
    /// Anthropic Messages API.
    Anthropic,
    /// OpenAI-compatible chat completions.
    #[serde(rename = "openai")]
    OpenAi,
    /// Local Ollama server.
    Ollama,
}

impl ProviderKind {
    /// Returns the canonical configuration name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Requests and responses
// ---------------------------------------------------------------------------

/// A single generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    /// Stage issuing the request.
    pub stage: Stage,
    /// Template variant the prompt was assembled for.
    pub template: TemplateId,
    /// Fully assembled prompt text.
    pub prompt: String,
    /// Model identifier understood by the provider.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Output token ceiling.
    pub max_tokens: u32,
    /// Whether the caller wants incremental output.
    pub stream: bool,
}

/// Token accounting reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens consumed.
    pub input: TokenCount,
    /// Completion tokens produced.
    pub output: TokenCount,
}

impl TokenUsage {
    /// Input plus output tokens.
    pub fn total(&self) -> TokenCount {
        self.input + self.output
    }
}

/// Rate-limit state observed on a provider response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitHeaders {
    /// Requests left in the current window.
    pub requests_remaining: Option<u64>,
    /// Tokens left in the current window.
    pub tokens_remaining: Option<u64>,
    /// Time until the request window resets.
    pub reset_after: Option<Duration>,
    /// Provider-mandated wait before the next request.
    pub retry_after: Option<Duration>,
}

impl RateLimitHeaders {
    /// Extracts rate-limit state from response headers.
    ///
    /// Header names are matched case-insensitively. Recognises `retry-after`,
    /// the OpenAI-style `x-ratelimit-*` family and the `anthropic-ratelimit-*`
    /// family. Returns `None` when no recognised header is present.
    pub fn from_headers(headers: &HashMap<String, String>) -> Option<Self> {
        let lookup = |names: &[&str]| -> Option<&str> {
            headers.iter().find_map(|(k, v)| {
                names
                    .iter()
                    .any(|n| k.eq_ignore_ascii_case(n))
                    .then_some(v.trim())
            })
        };

        let parsed = Self {
            requests_remaining: lookup(&[
                "x-ratelimit-remaining-requests",
                "anthropic-ratelimit-requests-remaining",
            ])
            .and_then(|v| v.parse().ok()),
            tokens_remaining: lookup(&[
                "x-ratelimit-remaining-tokens",
                "anthropic-ratelimit-tokens-remaining",
            ])
            .and_then(|v| v.parse().ok()),
            reset_after: lookup(&[
                "x-ratelimit-reset-requests",
                "anthropic-ratelimit-requests-reset",
            ])
            .and_then(parse_reset),
            retry_after: lookup(&["retry-after"]).and_then(parse_seconds),
        };

        (parsed != Self::default()).then_some(parsed)
    }
}

fn parse_seconds(value: &str) -> Option<Duration> {
    let secs: f64 = value.parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

/// Parses a reset value: plain seconds, a Go-style duration (`"1m30s"`,
/// `"250ms"`, `"6s"`), or an RFC 3339 instant.
fn parse_reset(value: &str) -> Option<Duration> {
    if let Some(d) = parse_seconds(value) {
        return Some(d);
    }
    if let Ok(at) = chrono::DateTime::parse_from_rfc3339(value) {
        let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
        return Some(delta.to_std().unwrap_or_default());
    }

    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut chars = value.chars().peekable();
    let mut matched = false;
    while let Some(ch) = chars.next() {
        if ch.is_ascii_digit() || ch == '.' {
            number.push(ch);
            continue;
        }
        let amount: f64 = number.parse().ok()?;
        number.clear();
        let part = match ch {
            'h' => Duration::from_secs_f64(amount * 3600.0),
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                Duration::from_secs_f64(amount / 1000.0)
            }
            'm' => Duration::from_secs_f64(amount * 60.0),
            's' => Duration::from_secs_f64(amount),
            _ => return None,
        };
        total += part;
        matched = true;
    }
    (matched && number.is_empty()).then_some(total)
}

/// Metadata delivered with the final chunk of a response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    /// Observed rate-limit state.
    pub rate_limit: Option<RateLimitHeaders>,
    /// Token usage.
    pub usage: Option<TokenUsage>,
}

/// A complete response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Generated text.
    pub text: String,
    /// Response metadata.
    pub metadata: ResponseMetadata,
}

/// One item of a streamed response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A chunk of generated text.
    Delta(String),
    /// End of stream; no further events follow.
    Completed(ResponseMetadata),
}

/// Stream of response events.
pub type LlmStream<'a> = BoxStream<'a, Result<StreamEvent, LlmError>>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures reported by an [`LlmClient`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LlmError {
    /// The provider rejected the request with a 429.
    #[error("rate limited by provider: {message}")]
    RateLimited {
        /// Provider-mandated wait, when supplied.
        retry_after: Option<Duration>,
        /// Provider message.
        message: String,
    },

    /// The provider returned an error response.
    #[error("provider error{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Provider {
        /// HTTP-equivalent status, when known.
        status: Option<u16>,
        /// Provider message.
        message: String,
    },

    /// The call did not finish in time.
    #[error("request timed out after {after:?}")]
    Timeout {
        /// Configured timeout.
        after: Duration,
    },

    /// The connection to the provider failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The credential is missing or was rejected.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The request itself is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The client cannot be built or used with the given configuration.
    #[error("client misconfigured: {0}")]
    Misconfiguration(String),

    /// The call was cancelled before completion.
    #[error("request cancelled")]
    Cancelled,

    /// The local rate limiter refused to wait any longer.
    #[error("rate limit wait ceiling exceeded after {waited:?}")]
    RateLimitExceeded {
        /// Time spent waiting.
        waited: Duration,
    },
}

impl Classify for LlmError {
    fn retryability(&self) -> Retryability {
        match self {
            Self::RateLimited { retry_after, .. } => Retryability::Retryable {
                after: *retry_after,
            },
            Self::Provider {
                status: Some(status),
                ..
            } if *status == 408 || *status >= 500 => Retryability::Retryable { after: None },
            Self::Provider { status: None, .. } | Self::Transport(_) | Self::Timeout { .. } => {
                Retryability::Retryable { after: None }
            }
            Self::Provider { .. }
            | Self::Authentication(_)
            | Self::InvalidRequest(_)
            | Self::Misconfiguration(_)
            | Self::Cancelled
            | Self::RateLimitExceeded { .. } => Retryability::NonRetryable,
        }
    }
}

impl LlmError {
    /// Returns the run-level taxonomy bucket for this failure.
    pub fn kind(&self) -> crate::ErrorKind {
        use crate::ErrorKind;
        match self {
            Self::Cancelled => ErrorKind::Cancelled,
            Self::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            Self::Authentication(_) | Self::InvalidRequest(_) | Self::Misconfiguration(_) => {
                ErrorKind::Fatal
            }
            other if other.retryability().is_retryable() => ErrorKind::Transient,
            _ => ErrorKind::Fatal,
        }
    }
}

// ---------------------------------------------------------------------------
// Client port
// ---------------------------------------------------------------------------

/// A provider capable of generating text.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Short provider name used in logs.
    fn name(&self) -> &str;

    /// Generates a complete response.
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Generates a response incrementally.
    ///
    /// The default implementation issues [`LlmClient::generate`] and yields the
    /// whole text as a single delta. Dropping the stream must abort the
    /// underlying call.
    fn stream<'a>(&'a self, request: &'a LlmRequest) -> LlmStream<'a> {
        stream::once(self.generate(request))
            .flat_map(|result| {
                let events = match result {
                    Ok(response) => vec![
                        Ok(StreamEvent::Delta(response.text)),
                        Ok(StreamEvent::Completed(response.metadata)),
                    ],
                    Err(error) => vec![Err(error)],
                };
                stream::iter(events)
            })
            .boxed()
    }
}
