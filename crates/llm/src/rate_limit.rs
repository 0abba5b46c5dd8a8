//! Sliding-window request limiting with provider feedback.
//!
//! A [`RateLimiter`] is shared by every call made with one provider credential.
//! Callers [`acquire`](RateLimiter::acquire) a [`RateTicket`] before issuing a
//! request and [`release`](RateLimiter::release) it with whatever the provider
//! reported. All budget mutation goes through these two methods.
//!
//! The local window guarantees that no more than `requests_per_window` tickets
//! are issued within any sliding `window`. Provider feedback can only tighten
//! that: an exhausted provider budget or a `Retry-After` blocks issuance until
//! the indicated instant. In adaptive mode the effective limit shrinks
//! multiplicatively after a 429 and recovers additively after a run of
//! successes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use pipeline::{RateLimitHeaders, RateLimitSettings, TokenCount};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Additive-increase / multiplicative-decrease parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveConfig {
    /// Factor applied to the effective fraction after a 429.
    pub decrease_factor: f64,
    /// Fraction restored after `success_threshold` consecutive successes.
    pub increase_step: f64,
    /// Consecutive successes needed before growing.
    pub success_threshold: u32,
    /// Lowest fraction of `requests_per_window` the limiter shrinks to.
    pub min_fraction: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            decrease_factor: 0.5,
            increase_step: 0.1,
            success_threshold: 5,
            min_fraction: 0.1,
        }
    }
}

/// Limiter parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    /// Tickets allowed in any sliding window.
    pub requests_per_window: u32,
    /// Window length.
    pub window: Duration,
    /// Longest a single `acquire` may wait before failing.
    pub max_wait: Duration,
    /// AIMD parameters; `None` disables adaptation.
    pub adaptive: Option<AdaptiveConfig>,
}

impl RateLimitConfig {
    /// Builds limiter parameters from the `[rate_limit]` configuration section.
    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        Self {
            requests_per_window: settings.requests_per_window.max(1),
            window: settings.window(),
            max_wait: settings.max_wait(),
            adaptive: settings.adaptive.then(AdaptiveConfig::default),
        }
    }
}

/// Snapshot of the budget as seen by the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudget {
    /// Tickets that could be issued right now.
    pub requests_remaining: u32,
    /// Provider-reported token budget, when known.
    pub tokens_remaining: Option<u64>,
    /// When capacity next frees up, if it is currently constrained.
    pub window_reset_at: Option<Instant>,
}

/// Proof of a granted request slot.
#[derive(Debug)]
#[must_use = "release the ticket with the observed outcome"]
pub struct RateTicket {
    id: u64,
    issued_at: Instant,
}

impl RateTicket {
    /// Monotonic ticket number.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// When the slot was granted.
    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }
}

/// What the caller observed for a ticketed request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseOutcome {
    /// Rate-limit headers from the response, if any.
    pub headers: Option<RateLimitHeaders>,
    /// The provider answered 429.
    pub rate_limited: bool,
    /// Provider-mandated wait carried by the error.
    pub retry_after: Option<Duration>,
    /// Tokens consumed by the request.
    pub tokens_used: Option<TokenCount>,
}

impl ReleaseOutcome {
    /// A successful request with the given headers.
    pub fn success(headers: Option<RateLimitHeaders>) -> Self {
        Self {
            headers,
            ..Self::default()
        }
    }

    /// A 429 response.
    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self {
            rate_limited: true,
            retry_after,
            ..Self::default()
        }
    }
}

/// Failures from [`RateLimiter::acquire`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    /// Waiting for capacity would exceed the configured ceiling.
    #[error("rate limit wait ceiling exceeded: waited {waited:?}, {needed:?} more required")]
    Exceeded {
        /// Time already spent waiting.
        waited: Duration,
        /// Additional wait that would have been needed.
        needed: Duration,
    },
    /// The cancellation token fired while waiting.
    #[error("cancelled while waiting for rate limit capacity")]
    Cancelled,
}

#[derive(Debug)]
struct State {
    issued: VecDeque<Instant>,
    provider_remaining: Option<u64>,
    tokens_remaining: Option<u64>,
    provider_reset_at: Option<Instant>,
    blocked_until: Option<Instant>,
    fraction: f64,
    consecutive_successes: u32,
}

/// Shared request limiter for one provider credential.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<State>,
    next_id: AtomicU64,
}

impl RateLimiter {
    /// Creates a limiter with a full budget.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config: RateLimitConfig {
                requests_per_window: config.requests_per_window.max(1),
                ..config
            },
            state: Mutex::new(State {
                issued: VecDeque::new(),
                provider_remaining: None,
                tokens_remaining: None,
                provider_reset_at: None,
                blocked_until: None,
                fraction: 1.0,
                consecutive_successes: 0,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// The limiter's parameters.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Waits for a request slot.
    pub async fn acquire(&self) -> Result<RateTicket, RateLimitError> {
        self.acquire_inner(None).await
    }

    /// Waits for a request slot, giving up when `token` is cancelled.
    pub async fn acquire_cancellable(
        &self,
        token: &CancellationToken,
    ) -> Result<RateTicket, RateLimitError> {
        self.acquire_inner(Some(token)).await
    }

    async fn acquire_inner(
        &self,
        token: Option<&CancellationToken>,
    ) -> Result<RateTicket, RateLimitError> {
        let started = Instant::now();
        loop {
            if token.is_some_and(CancellationToken::is_cancelled) {
                return Err(RateLimitError::Cancelled);
            }

            let wait = match self.try_acquire() {
                Ok(ticket) => return Ok(ticket),
                Err(wait) => wait,
            };

            let waited = started.elapsed();
            if waited + wait > self.config.max_wait {
                warn!(
                    waited_ms = waited.as_millis() as u64,
                    needed_ms = wait.as_millis() as u64,
                    "Rate limit wait ceiling exceeded"
                );
                return Err(RateLimitError::Exceeded {
                    waited,
                    needed: wait,
                });
            }

            debug!(wait_ms = wait.as_millis() as u64, "Waiting for rate limit capacity");
            match token {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => return Err(RateLimitError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Issues a ticket now, or returns how long until one could be issued.
    fn try_acquire(&self) -> Result<RateTicket, Duration> {
        let now = Instant::now();
        let mut state = self.lock();
        self.expire(&mut state, now);

        let ready_at = self.ready_at(&state, now);
        if ready_at > now {
            return Err(ready_at - now);
        }

        state.issued.push_back(now);
        if let Some(remaining) = state.provider_remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
        Ok(RateTicket {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            issued_at: now,
        })
    }

    /// Folds the observed outcome of a ticketed request into the budget.
    pub fn release(&self, ticket: RateTicket, outcome: ReleaseOutcome) {
        let now = Instant::now();
        let mut state = self.lock();

        if let Some(headers) = outcome.headers {
            if let Some(remaining) = headers.requests_remaining {
                state.provider_remaining = Some(remaining);
                state.provider_reset_at = Some(now + headers.reset_after.unwrap_or(self.config.window));
            }
            if let Some(tokens) = headers.tokens_remaining {
                state.tokens_remaining = Some(tokens);
            }
        } else if let (Some(tokens), Some(used)) = (state.tokens_remaining, outcome.tokens_used) {
            state.tokens_remaining = Some(tokens.saturating_sub(used.as_u64()));
        }

        let retry_after = outcome
            .retry_after
            .or_else(|| outcome.headers.and_then(|h| h.retry_after));
        if let Some(delay) = retry_after {
            let until = now + delay;
            state.blocked_until = Some(state.blocked_until.map_or(until, |b| b.max(until)));
        }

        if outcome.rate_limited {
            state.consecutive_successes = 0;
            if let Some(adaptive) = self.config.adaptive {
                state.fraction = (state.fraction * adaptive.decrease_factor).max(adaptive.min_fraction);
            }
            warn!(
                ticket = ticket.id,
                retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
                effective_limit = self.effective_limit(&state),
                "Provider rate limited request"
            );
        } else if let Some(adaptive) = self.config.adaptive {
            state.consecutive_successes += 1;
            if state.consecutive_successes >= adaptive.success_threshold && state.fraction < 1.0 {
                state.fraction = (state.fraction + adaptive.increase_step).min(1.0);
                state.consecutive_successes = 0;
                debug!(effective_limit = self.effective_limit(&state), "Rate budget recovering");
            }
        }
    }

    /// Current budget snapshot.
    pub fn budget(&self) -> RateBudget {
        let now = Instant::now();
        let mut state = self.lock();
        self.expire(&mut state, now);

        let limit = self.effective_limit(&state) as usize;
        let local = limit.saturating_sub(state.issued.len()) as u32;
        let requests_remaining = match state.provider_remaining {
            Some(provider) => local.min(u32::try_from(provider).unwrap_or(u32::MAX)),
            None => local,
        };
        let ready_at = self.ready_at(&state, now);
        let window_reset_at = if ready_at > now {
            Some(ready_at)
        } else if !state.issued.is_empty() {
            state.issued.front().map(|t| *t + self.config.window)
        } else {
            None
        };
        RateBudget {
            requests_remaining: if ready_at > now { 0 } else { requests_remaining },
            tokens_remaining: state.tokens_remaining,
            window_reset_at,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // State stays consistent across a panic: every mutation is a single assignment.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn effective_limit(&self, state: &State) -> u32 {
        let scaled = (f64::from(self.config.requests_per_window) * state.fraction).floor() as u32;
        scaled.clamp(1, self.config.requests_per_window)
    }

    fn expire(&self, state: &mut State, now: Instant) {
        while let Some(front) = state.issued.front() {
            if *front + self.config.window <= now {
                state.issued.pop_front();
            } else {
                break;
            }
        }
        if state.blocked_until.is_some_and(|b| b <= now) {
            state.blocked_until = None;
        }
        if state.provider_reset_at.is_some_and(|r| r <= now) {
            state.provider_reset_at = None;
            state.provider_remaining = None;
            state.tokens_remaining = None;
        }
    }

    /// Earliest instant a new ticket may be issued.
    fn ready_at(&self, state: &State, now: Instant) -> Instant {
        let mut ready = now;
        if let Some(blocked) = state.blocked_until {
            ready = ready.max(blocked);
        }
        let limit = self.effective_limit(state) as usize;
        if state.issued.len() >= limit {
            let index = state.issued.len() - limit;
            if let Some(oldest) = state.issued.get(index) {
                ready = ready.max(*oldest + self.config.window);
            }
        }
        let provider_exhausted =
            state.provider_remaining == Some(0) || state.tokens_remaining == Some(0);
        if provider_exhausted {
            if let Some(reset) = state.provider_reset_at {
                ready = ready.max(reset);
            }
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn limiter(per_window: u32, window_secs: u64, max_wait_secs: u64, adaptive: bool) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            requests_per_window: per_window,
            window: Duration::from_secs(window_secs),
            max_wait: Duration::from_secs(max_wait_secs),
            adaptive: adaptive.then(AdaptiveConfig::default),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_never_exceed_window() {
        let limiter = Arc::new(limiter(3, 10, 600, false));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                let ticket = limiter.acquire().await.unwrap();
                let at = ticket.issued_at();
                limiter.release(ticket, ReleaseOutcome::success(None));
                at
            }));
        }
        let mut issued = Vec::new();
        for handle in handles {
            issued.push(handle.await.unwrap());
        }
        issued.sort();

        let window = Duration::from_secs(10);
        for (i, start) in issued.iter().enumerate() {
            let in_window = issued[i..].iter().filter(|t| **t < *start + window).count();
            assert!(in_window <= 3, "{in_window} tickets within one window");
        }
        // 10 tickets at 3 per window need at least three full windows.
        assert!(*issued.last().unwrap() - issued[0] >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ceiling_raises_instead_of_blocking() {
        let limiter = limiter(1, 60, 5, false);
        let first = limiter.acquire().await.unwrap();
        limiter.release(first, ReleaseOutcome::success(None));

        let started = Instant::now();
        let err = limiter.acquire().await.unwrap_err();
        assert_eq!(
            err,
            RateLimitError::Exceeded {
                waited: Duration::ZERO,
                needed: Duration::from_secs(60),
            }
        );
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_blocks_issuance() {
        let limiter = limiter(100, 60, 60, false);
        let ticket = limiter.acquire().await.unwrap();
        limiter.release(ticket, ReleaseOutcome::rate_limited(Some(Duration::from_secs(5))));

        let started = Instant::now();
        let ticket = limiter.acquire().await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        limiter.release(ticket, ReleaseOutcome::success(None));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_provider_budget_waits_for_reset() {
        let limiter = limiter(100, 60, 60, false);
        let ticket = limiter.acquire().await.unwrap();
        limiter.release(
            ticket,
            ReleaseOutcome::success(Some(RateLimitHeaders {
                requests_remaining: Some(0),
                tokens_remaining: Some(1_000),
                reset_after: Some(Duration::from_secs(7)),
                retry_after: None,
            })),
        );
        let budget = limiter.budget();
        assert_eq!(budget.requests_remaining, 0);
        assert_eq!(budget.tokens_remaining, Some(1_000));
        assert!(budget.window_reset_at.is_some());

        let started = Instant::now();
        let ticket = limiter.acquire().await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(7));
        limiter.release(ticket, ReleaseOutcome::success(None));
    }

    #[tokio::test(start_paused = true)]
    async fn provider_budget_decrements_optimistically() {
        let limiter = limiter(100, 60, 60, false);
        let ticket = limiter.acquire().await.unwrap();
        limiter.release(
            ticket,
            ReleaseOutcome::success(Some(RateLimitHeaders {
                requests_remaining: Some(2),
                ..RateLimitHeaders::default()
            })),
        );
        let a = limiter.acquire().await.unwrap();
        let b = limiter.acquire().await.unwrap();
        assert_eq!(limiter.budget().requests_remaining, 0);
        limiter.release(a, ReleaseOutcome::default());
        limiter.release(b, ReleaseOutcome::default());
    }

    #[tokio::test(start_paused = true)]
    async fn adaptive_mode_shrinks_and_recovers() {
        let limiter = limiter(10, 60, 600, true);
        let ticket = limiter.acquire().await.unwrap();
        limiter.release(ticket, ReleaseOutcome::rate_limited(None));
        // Limit halves to 5; one ticket is still inside the window.
        assert_eq!(limiter.budget().requests_remaining, 4);

        tokio::time::advance(Duration::from_secs(61)).await;
        for _ in 0..5 {
            let ticket = limiter.acquire().await.unwrap();
            limiter.release(ticket, ReleaseOutcome::success(None));
        }
        // Five successes restore one step: limit 6, five tickets in window.
        assert_eq!(limiter.budget().requests_remaining, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_waiting() {
        let limiter = limiter(1, 60, 600, false);
        let ticket = limiter.acquire().await.unwrap();
        limiter.release(ticket, ReleaseOutcome::success(None));

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        assert_eq!(
            limiter.acquire_cancellable(&token).await.unwrap_err(),
            RateLimitError::Cancelled
        );
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[test]
    fn settings_map_to_config() {
        let config = RateLimitConfig::from_settings(&RateLimitSettings::default());
        assert_eq!(config.requests_per_window, 50);
        assert_eq!(config.window, Duration::from_secs(60));
        assert_eq!(config.max_wait, Duration::from_secs(300));
        assert!(config.adaptive.is_some());
    }
}
