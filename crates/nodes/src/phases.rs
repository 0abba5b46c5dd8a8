//! Concurrent phase expansion.
//!
//! Every missing phase is requested at once; the gateway's concurrency slots
//! bound how many are in flight. Results are merged by phase number after all
//! requests settle, so one failed phase never discards the others.

use std::collections::BTreeMap;

use futures::future::join_all;
use pipeline::{ComplexityProfile, Stage};
use tracing::{info, warn};

use crate::gateway::{GatewayError, LlmGateway};
use crate::prompts;

/// Settled results of one expansion pass.
#[derive(Debug, Default)]
pub struct PhaseExpansion {
    /// Phase documents produced, including those carried in from earlier passes.
    pub phases: BTreeMap<u32, String>,
    /// Phases that failed, by number.
    pub failures: BTreeMap<u32, GatewayError>,
}

impl PhaseExpansion {
    /// Returns `true` when every phase has a document.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Expands phases `1..=profile.estimated_phase_count` that `done` does not hold yet.
pub async fn expand_phases(
    gateway: &LlmGateway,
    profile: &ComplexityProfile,
    design: &str,
    devplan: &str,
    done: &BTreeMap<u32, String>,
) -> PhaseExpansion {
    let template = prompts::template_for(Stage::PhaseExpansion, profile.depth_level);
    let pending: Vec<u32> = (1..=profile.estimated_phase_count)
        .filter(|n| !done.contains_key(n))
        .collect();
    if pending.len() < profile.estimated_phase_count as usize {
        info!(reused = done.len(), pending = pending.len(), "Reusing phases from an earlier pass");
    }

    let requests = pending.iter().map(|&number| {
        let prompt = prompts::phase(profile, design, devplan, number);
        let template = &template;
        async move { (number, gateway.complete(template, &prompt).await) }
    });

    let mut expansion = PhaseExpansion {
        phases: done.clone(),
        failures: BTreeMap::new(),
    };
    for (number, result) in join_all(requests).await {
        match result {
            Ok(completion) => {
                expansion.phases.insert(number, completion.text);
            }
            Err(error) => {
                warn!(phase = number, error = %error, "Phase expansion failed");
                expansion.failures.insert(number, error);
            }
        }
    }
    expansion
}

/// Concatenates phase documents in phase order.
pub fn render_phases(phases: &BTreeMap<u32, String>) -> String {
    phases
        .iter()
        .map(|(number, text)| format!("# Phase {number}\n\n{}\n", text.trim_end()))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use llm::{ConcurrencyManager, RateLimitConfig, RateLimiter, RetryPolicy, ScriptedClient, ScriptedReply};
    use pipeline::{Confidence, LlmError, PipelineConfig};
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn gateway(client: Arc<ScriptedClient>, limit: usize) -> LlmGateway {
        let config = PipelineConfig::default();
        LlmGateway::new(
            client,
            config.resolve_client(Stage::PhaseExpansion),
            Arc::new(RateLimiter::new(RateLimitConfig::from_settings(&config.rate_limit))),
            ConcurrencyManager::new(limit).unwrap(),
            RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1), 0.0),
            CancellationToken::new(),
        )
    }

    fn profile() -> ComplexityProfile {
        // Three phases.
        ComplexityProfile::from_score(2.0, Confidence::certain(), "small")
    }

    #[tokio::test]
    async fn one_failure_keeps_the_other_phases() {
        let client = Arc::new(
            ScriptedClient::new()
                .push(ScriptedReply::text("phase one"))
                .push(ScriptedReply::Error(LlmError::InvalidRequest("bad".into())))
                .push(ScriptedReply::text("phase three")),
        );
        let expansion = expand_phases(&gateway(client, 1), &profile(), "d", "p", &BTreeMap::new()).await;
        assert!(!expansion.is_complete());
        assert_eq!(expansion.phases.len(), 2);
        assert_eq!(expansion.failures.len(), 1);
    }

    #[tokio::test]
    async fn finished_phases_are_not_requested_again() {
        let client = Arc::new(ScriptedClient::new().with_fallback("fresh"));
        let done = BTreeMap::from([(1, "kept".to_string()), (3, "kept".to_string())]);
        let expansion = expand_phases(&gateway(client.clone(), 4), &profile(), "d", "p", &done).await;
        assert!(expansion.is_complete());
        assert_eq!(client.total_calls(), 1);
        assert_eq!(expansion.phases[&2], "fresh");
        assert_eq!(expansion.phases[&1], "kept");
    }

    #[test]
    fn rendering_follows_phase_order() {
        let phases = BTreeMap::from([(2, "b".to_string()), (1, "a\n".to_string())]);
        assert_eq!(render_phases(&phases), "# Phase 1\n\na\n\n# Phase 2\n\nb\n");
    }
}
