//! Exponential backoff with jitter, honouring provider `Retry-After`.
//!
//! [`RetryPolicy`] is a stateless decorator: it holds only its parameters, so
//! one policy can wrap any number of concurrent operations.

use std::future::Future;
use std::time::Duration;

use pipeline::{Classify, RetrySettings, Retryability};
use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Exponent ceiling; `2^62` seconds already exceeds any sensible `max_delay`.
const MAX_EXPONENT: u32 = 62;

/// Retry parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

/// Failure returned by [`RetryPolicy::execute`].
#[derive(Debug, Error, PartialEq)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempt(s): {error}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Last error.
        error: E,
    },

    /// An attempt failed with a non-retryable error.
    #[error("non-retryable failure on attempt {attempts}: {error}")]
    Fatal {
        /// Attempts made.
        attempts: u32,
        /// The error.
        error: E,
    },

    /// The cancellation token fired before an attempt or during backoff.
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled {
        /// Attempts made.
        attempts: u32,
        /// Error of the last attempt, if any ran.
        last: Option<E>,
    },
}

impl<E> RetryError<E> {
    /// Attempts made before the policy stopped.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. }
            | Self::Fatal { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// The last operation error, if any.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Exhausted { error, .. } | Self::Fatal { error, .. } => Some(error),
            Self::Cancelled { last, .. } => last,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy. `max_attempts` is raised to 1 and `jitter` clamped to `[0, 1]`.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        let jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter,
        }
    }

    /// Builds a policy from the `[retry]` configuration section.
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(
            settings.max_attempts,
            settings.base_delay(),
            settings.max_delay(),
            settings.jitter,
        )
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Computed backoff before retry number `attempt` (0-based).
    ///
    /// `jitter_sample` in `[-1, 1]` scales the jitter band:
    /// `min(max_delay, base_delay * 2^attempt) * (1 + jitter * jitter_sample)`.
    pub fn backoff_delay(&self, attempt: u32, jitter_sample: f64) -> Duration {
        let exp = 2f64.powi(attempt.min(MAX_EXPONENT) as i32);
        let raw = (self.base_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
        let sample = if jitter_sample.is_finite() {
            jitter_sample.clamp(-1.0, 1.0)
        } else {
            0.0
        };
        Duration::from_secs_f64((raw * (1.0 + self.jitter * sample)).max(0.0))
    }

    /// Upper bound on total backoff sleep across all attempts, excluding
    /// provider-mandated `Retry-After` waits.
    pub fn max_total_backoff(&self) -> Duration {
        (0..self.max_attempts)
            .map(|i| self.backoff_delay(i, 1.0))
            .sum()
    }

    /// Delay before the next attempt: the provider's `Retry-After` when
    /// present, otherwise jittered exponential backoff.
    fn delay_for(&self, attempt: u32, retryability: &Retryability) -> Duration {
        match retryability {
            Retryability::Retryable { after: Some(after) } => *after,
            _ => {
                let sample = rand::thread_rng().gen_range(-1.0..=1.0);
                self.backoff_delay(attempt, sample)
            }
        }
    }

    /// Runs `operation` until it succeeds, fails fatally, or attempts run out.
    pub async fn execute<T, E, Op, Fut>(&self, operation: Op) -> Result<T, RetryError<E>>
    where
        E: Classify + std::fmt::Display,
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with(E::retryability, operation).await
    }

    /// Like [`Self::execute`] with a caller-supplied classifier.
    pub async fn execute_with<T, E, C, Op, Fut>(
        &self,
        classify: C,
        operation: Op,
    ) -> Result<T, RetryError<E>>
    where
        E: std::fmt::Display,
        C: Fn(&E) -> Retryability,
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(classify, operation, None).await
    }

    /// Like [`Self::execute`], stopping promptly when `token` is cancelled.
    ///
    /// The token is checked before every attempt and raced against every
    /// backoff sleep.
    pub async fn execute_cancellable<T, E, Op, Fut>(
        &self,
        token: &CancellationToken,
        operation: Op,
    ) -> Result<T, RetryError<E>>
    where
        E: Classify + std::fmt::Display,
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(E::retryability, operation, Some(token)).await
    }

    async fn run<T, E, C, Op, Fut>(
        &self,
        classify: C,
        mut operation: Op,
        token: Option<&CancellationToken>,
    ) -> Result<T, RetryError<E>>
    where
        E: std::fmt::Display,
        C: Fn(&E) -> Retryability,
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut last: Option<E> = None;
        for attempt in 1..=self.max_attempts {
            if token.is_some_and(CancellationToken::is_cancelled) {
                return Err(RetryError::Cancelled {
                    attempts: attempt - 1,
                    last,
                });
            }

            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let retryability = classify(&error);
            if !retryability.is_retryable() {
                return Err(RetryError::Fatal {
                    attempts: attempt,
                    error,
                });
            }
            if attempt == self.max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    error,
                });
            }

            let delay = self.delay_for(attempt - 1, &retryability);
            warn!(
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retryable failure; backing off"
            );
            last = Some(error);

            match token {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            return Err(RetryError::Cancelled { attempts: attempt, last });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }

        // Unreachable: the final attempt always returns above.
        Err(RetryError::Cancelled {
            attempts: self.max_attempts,
            last,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use pipeline::LlmError;
    use proptest::prelude::*;
    use tokio::time::Instant;

    use super::*;

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_secs(1), Duration::from_secs(8), 0.2)
    }

    fn server_error() -> LlmError {
        LlmError::Provider {
            status: Some(503),
            message: "overloaded".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = policy(4)
            .execute(|| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(server_error())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_attempts_and_bounded_sleep() {
        let p = policy(4);
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();
        let result: Result<(), _> = p
            .execute(|| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(server_error())
                }
            })
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { attempts: 4, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() <= p.max_total_backoff());
        // Three sleeps of at least 0.8s, 1.6s and 3.2s.
        assert!(started.elapsed() >= Duration::from_millis(5_600));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_do_not_sleep() {
        let started = Instant::now();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(5)
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(LlmError::Authentication("bad key".into())) }
            })
            .await;
        assert!(matches!(result, Err(RetryError::Fatal { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_overrides_backoff() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result = policy(3)
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(LlmError::RateLimited {
                            retry_after: Some(Duration::from_secs(20)),
                            message: "429".into(),
                        })
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(1));
        assert_eq!(started.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result: Result<(), _> = policy(5)
            .execute_cancellable(&token, || async { Err(server_error()) })
            .await;
        match result {
            Err(RetryError::Cancelled { attempts, last }) => {
                assert_eq!(attempts, 1);
                assert_eq!(last, Some(server_error()));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_millis(800));
    }

    #[tokio::test]
    async fn cancelled_token_prevents_first_attempt() {
        let token = CancellationToken::new();
        token.cancel();
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<LlmError>> = policy(3)
            .execute_cancellable(&token, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 0, last: None })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_classifier_is_used() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(3)
            .execute_with(
                |_: &LlmError| Retryability::NonRetryable,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(server_error()) }
                },
            )
            .await;
        assert!(matches!(result, Err(RetryError::Fatal { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn settings_are_clamped() {
        let p = RetryPolicy::new(0, Duration::from_secs(2), Duration::from_secs(1), 4.0);
        assert_eq!(p.max_attempts(), 1);
        assert_eq!(p.backoff_delay(3, 0.0), Duration::from_secs(2));
        assert_eq!(p.backoff_delay(0, 1.0), Duration::from_secs(4));
    }

    proptest! {
        #[test]
        fn backoff_stays_within_jitter_band(
            attempt in 0u32..80,
            sample in -1.0f64..=1.0,
            base_ms in 0u64..5_000,
            max_ms in 0u64..120_000,
            jitter in 0.0f64..=1.0,
        ) {
            let p = RetryPolicy::new(
                5,
                Duration::from_millis(base_ms),
                Duration::from_millis(max_ms),
                jitter,
            );
            let ceiling = (base_ms as f64 * 2f64.powi(attempt.min(MAX_EXPONENT) as i32))
                .min(max_ms.max(base_ms) as f64)
                / 1000.0;
            let delay = p.backoff_delay(attempt, sample).as_secs_f64();
            prop_assert!(delay <= ceiling * (1.0 + jitter) + 1e-6);
            prop_assert!(delay >= ceiling * (1.0 - jitter) - 1e-6);
        }

        #[test]
        fn total_backoff_bounded_by_sum(attempts in 1u32..10, jitter in 0.0f64..=1.0) {
            let p = RetryPolicy::new(attempts, Duration::from_millis(250), Duration::from_secs(5), jitter);
            let bound: f64 = (0..attempts)
                .map(|i| (0.25 * 2f64.powi(i as i32)).min(5.0))
                .sum::<f64>()
                * (1.0 + jitter);
            prop_assert!(p.max_total_backoff().as_secs_f64() <= bound + 1e-6);
        }
    }
}
