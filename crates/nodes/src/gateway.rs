//! The single path every stage takes to reach an LLM.
//!
//! [`LlmGateway`] binds one stage's client to the run-wide protection layers.
//! Each attempt checks the cancellation token, takes a concurrency slot, takes
//! a rate ticket, and consumes the response stream chunk by chunk. The retry
//! policy wraps the whole attempt, so backoff sleeps hold neither a slot nor a
//! ticket.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt;
use llm::{
    ConcurrencyManager, RateLimitError, RateLimiter, ReleaseOutcome, RetryError, RetryPolicy,
    SlotError,
};
use pipeline::{
    CollaboratorError, LlmClient, LlmError, LlmRequest, ResolvedClient, ResponseMetadata, Stage,
    StreamEvent, TemplateId, TokenUsage,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// A successful completion.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Generated text.
    pub text: String,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    /// Token usage, when the provider reported it.
    pub usage: Option<TokenUsage>,
}

impl Completion {
    /// Retries beyond the first attempt.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// A failed completion.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct GatewayError {
    /// The last failure.
    pub error: LlmError,
    /// Attempts made.
    pub attempts: u32,
    /// Text streamed by the last attempt that produced any.
    pub partial_output: String,
}

impl From<GatewayError> for CollaboratorError {
    fn from(failure: GatewayError) -> Self {
        CollaboratorError::Call {
            kind: failure.error.kind(),
            message: failure.error.to_string(),
            attempts: failure.attempts,
            partial_output: failure.partial_output,
        }
    }
}

/// One stage's client wrapped in cancellation, concurrency, rate limiting and retry.
pub struct LlmGateway {
    client: Arc<dyn LlmClient>,
    settings: ResolvedClient,
    limiter: Arc<RateLimiter>,
    concurrency: ConcurrencyManager,
    retry: RetryPolicy,
    cancel: CancellationToken,
    retries: AtomicU32,
}

impl std::fmt::Debug for LlmGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmGateway")
            .field("client", &self.client.name())
            .field("stage", &self.settings.stage)
            .field("model", &self.settings.model)
            .finish_non_exhaustive()
    }
}

impl LlmGateway {
    /// Binds `client` to the shared protection layers.
    pub fn new(
        client: Arc<dyn LlmClient>,
        settings: ResolvedClient,
        limiter: Arc<RateLimiter>,
        concurrency: ConcurrencyManager,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            settings,
            limiter,
            concurrency,
            retry,
            cancel,
            retries: AtomicU32::new(0),
        }
    }

    /// Stage the gateway serves.
    pub fn stage(&self) -> Stage {
        self.settings.stage
    }

    /// Effective client settings.
    pub fn settings(&self) -> &ResolvedClient {
        &self.settings
    }

    /// Token observed by every attempt.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Retries performed by every call so far, successful or not.
    pub fn total_retries(&self) -> u32 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Sends `prompt` rendered for `template` and returns the full completion.
    #[instrument(skip_all, fields(stage = %self.settings.stage, template = %template))]
    pub async fn complete(&self, template: &TemplateId, prompt: &str) -> Result<Completion, GatewayError> {
        let request = LlmRequest {
            stage: self.settings.stage,
            template: template.clone(),
            prompt: prompt.to_string(),
            model: self.settings.model.clone(),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            stream: true,
        };
        let partial = Mutex::new(String::new());
        let attempts = AtomicU32::new(0);

        let result = self
            .retry
            .execute_cancellable(&self.cancel, || {
                attempts.fetch_add(1, Ordering::Relaxed);
                self.attempt(&request, &partial)
            })
            .await;

        let made = match &result {
            Ok(_) => attempts.load(Ordering::Relaxed),
            Err(e) => e.attempts(),
        };
        self.retries.fetch_add(made.saturating_sub(1), Ordering::Relaxed);

        let partial_output = || partial.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match result {
            Ok((text, metadata)) => {
                let attempts = attempts.load(Ordering::Relaxed);
                info!(attempts, chars = text.len(), "LLM call completed");
                Ok(Completion {
                    text,
                    attempts,
                    usage: metadata.usage,
                })
            }
            Err(RetryError::Cancelled { attempts, .. }) => Err(GatewayError {
                error: LlmError::Cancelled,
                attempts,
                partial_output: partial_output(),
            }),
            Err(RetryError::Exhausted { attempts, error } | RetryError::Fatal { attempts, error }) => {
                Err(GatewayError {
                    error,
                    attempts,
                    partial_output: partial_output(),
                })
            }
        }
    }

    async fn attempt(
        &self,
        request: &LlmRequest,
        partial: &Mutex<String>,
    ) -> Result<(String, ResponseMetadata), LlmError> {
        if self.cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        self.concurrency
            .run_with_limit_cancellable(&self.cancel, self.stream_once(request, partial))
            .await
            .map_err(|e| match e {
                SlotError::Cancelled => LlmError::Cancelled,
                SlotError::Closed => LlmError::Misconfiguration("concurrency manager closed".into()),
            })?
    }

    async fn stream_once(
        &self,
        request: &LlmRequest,
        partial: &Mutex<String>,
    ) -> Result<(String, ResponseMetadata), LlmError> {
        let ticket = self
            .limiter
            .acquire_cancellable(&self.cancel)
            .await
            .map_err(|e| match e {
                RateLimitError::Exceeded { waited, .. } => LlmError::RateLimitExceeded { waited },
                RateLimitError::Cancelled => LlmError::Cancelled,
            })?;

        let mut text = String::new();
        let outcome = {
            let mut events = self.client.stream(request);
            loop {
                let next = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Some(Err(LlmError::Cancelled)),
                    event = events.next() => event,
                };
                match next {
                    Some(Ok(StreamEvent::Delta(chunk))) => text.push_str(&chunk),
                    Some(Ok(StreamEvent::Completed(metadata))) => break Ok(metadata),
                    Some(Err(error)) => break Err(error),
                    None => break Ok(ResponseMetadata::default()),
                }
            }
        };

        let release = match &outcome {
            Ok(metadata) => ReleaseOutcome {
                headers: metadata.rate_limit,
                tokens_used: metadata.usage.map(|u| u.total()),
                ..ReleaseOutcome::default()
            },
            Err(LlmError::RateLimited { retry_after, .. }) => ReleaseOutcome::rate_limited(*retry_after),
            Err(_) => ReleaseOutcome::default(),
        };
        self.limiter.release(ticket, release);

        match outcome {
            Ok(metadata) => Ok((text, metadata)),
            Err(error) => {
                if !text.is_empty() {
                    debug!(chars = text.len(), error = %error, "Keeping partial output of failed attempt");
                    *partial.lock().unwrap_or_else(PoisonError::into_inner) = text;
                }
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use llm::{RateLimitConfig, ScriptedClient, ScriptedReply};
    use pipeline::{PipelineConfig, TokenCount};
    use tokio::time::Instant;

    use super::*;

    fn gateway(client: ScriptedClient, cancel: CancellationToken) -> LlmGateway {
        let config = PipelineConfig::default();
        LlmGateway::new(
            Arc::new(client),
            config.resolve_client(Stage::Design),
            Arc::new(RateLimiter::new(RateLimitConfig::from_settings(&config.rate_limit))),
            ConcurrencyManager::new(2).unwrap(),
            RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(8), 0.0),
            cancel,
        )
    }

    fn template() -> TemplateId {
        TemplateId::new("design/standard").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried() {
        let client = ScriptedClient::new()
            .push(ScriptedReply::Error(LlmError::Transport("reset".into())))
            .push(ScriptedReply::Response(pipeline::LlmResponse {
                text: "design".into(),
                metadata: ResponseMetadata {
                    rate_limit: None,
                    usage: Some(TokenUsage {
                        input: TokenCount::new(10),
                        output: TokenCount::new(5),
                    }),
                },
            }));
        let completion = gateway(client, CancellationToken::new())
            .complete(&template(), "prompt")
            .await
            .unwrap();
        assert_eq!(completion.text, "design");
        assert_eq!(completion.attempts, 2);
        assert_eq!(completion.retries(), 1);
        assert_eq!(completion.usage.unwrap().total(), TokenCount::new(15));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_is_honoured() {
        let client = ScriptedClient::new()
            .push(ScriptedReply::Error(LlmError::RateLimited {
                retry_after: Some(Duration::from_secs(20)),
                message: "slow down".into(),
            }))
            .push(ScriptedReply::text("ok"));
        let started = Instant::now();
        let completion = gateway(client, CancellationToken::new())
            .complete(&template(), "prompt")
            .await
            .unwrap();
        assert_eq!(completion.attempts, 2);
        assert!(started.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let client = ScriptedClient::new()
            .push(ScriptedReply::Error(LlmError::Authentication("bad key".into())))
            .push(ScriptedReply::text("never"));
        let err = gateway(client, CancellationToken::new())
            .complete(&template(), "prompt")
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert!(matches!(err.error, LlmError::Authentication(_)));
        assert_eq!(CollaboratorError::from(err).kind(), pipeline::ErrorKind::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_keep_partial_output() {
        let failing = || ScriptedReply::Partial {
            chunks: vec!["# Over".into()],
            error: LlmError::Provider {
                status: Some(503),
                message: "overloaded".into(),
            },
        };
        let client = ScriptedClient::new().push(failing()).push(failing()).push(failing());
        let gateway = gateway(client, CancellationToken::new());
        let err = gateway.complete(&template(), "prompt").await.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.partial_output, "# Over");
        assert_eq!(gateway.total_retries(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_mid_stream_preserves_partial_output() {
        let cancel = CancellationToken::new();
        let client = ScriptedClient::new().push(ScriptedReply::Stalled(vec!["# Overview\n".into()]));
        let gateway = gateway(client, cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });
        let err = gateway.complete(&template(), "prompt").await.unwrap_err();
        assert_eq!(err.error, LlmError::Cancelled);
        assert_eq!(err.partial_output, "# Overview\n");
        assert_eq!(CollaboratorError::from(err).kind(), pipeline::ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn cancelled_token_issues_no_call() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let client = Arc::new(ScriptedClient::new().with_fallback("x"));
        let config = PipelineConfig::default();
        let gateway = LlmGateway::new(
            client.clone(),
            config.resolve_client(Stage::Design),
            Arc::new(RateLimiter::new(RateLimitConfig::from_settings(&config.rate_limit))),
            ConcurrencyManager::new(1).unwrap(),
            RetryPolicy::default(),
            cancel,
        );
        let err = gateway.complete(&template(), "prompt").await.unwrap_err();
        assert_eq!(err.error, LlmError::Cancelled);
        assert_eq!(client.total_calls(), 0);
    }
}
