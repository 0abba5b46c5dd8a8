//! Planforge LLM call substrate.
//!
//! Everything that wraps an outbound LLM call lives here. None of it knows
//! about stages or documents; the `nodes` crate composes these pieces around
//! each stage's client.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Implements the [`pipeline::LlmClient`] port and the
//! shared call-protection machinery. The [`pipeline`] crate sees only the port.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`retry`] | `RetryPolicy`: exponential backoff with jitter and `Retry-After` |
//! | [`rate_limit`] | `RateLimiter`: sliding window, provider budget, adaptive throttling |
//! | [`concurrency`] | `ConcurrencyManager`: bounded in-flight work |
//! | [`factory`] | `LlmClientFactory`: constructors keyed by `ProviderKind` |
//! | [`command`] | `CommandClient`: the subprocess provider |
//! | [`scripted`] | `ScriptedClient`: canned replies for dry runs and tests |

pub mod command;
pub mod concurrency;
pub mod factory;
pub mod rate_limit;
pub mod retry;
pub mod scripted;

pub use command::{classify_failure, CommandClient};
pub use concurrency::{ConcurrencyManager, SlotError};
pub use factory::{ClientConstructor, LlmClientFactory};
pub use rate_limit::{
    AdaptiveConfig, RateBudget, RateLimitConfig, RateLimitError, RateLimiter, RateTicket,
    ReleaseOutcome,
};
pub use retry::{RetryError, RetryPolicy};
pub use scripted::{ScriptedClient, ScriptedReply};
