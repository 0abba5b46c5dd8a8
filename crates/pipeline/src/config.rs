//! Pipeline configuration.
//!
//! [`PipelineConfig`] is an explicit value passed into the orchestrator; there
//! are no process-wide configuration caches. Every field has a default so an
//! empty TOML document is a valid configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    DesignValidator, PlanforgeError, ProviderKind, Stage, StagnationPolicy, ValidatorConfig,
};

/// Default number of concurrent LLM calls.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 4;
/// Default correction iteration cap.
pub const DEFAULT_MAX_CORRECTION_ITERATIONS: u32 = 3;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// `[retry]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Backoff before the first retry.
    pub base_delay_seconds: f64,
    /// Backoff ceiling.
    pub max_delay_seconds: f64,
    /// Jitter fraction in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_seconds: 1.0,
            max_delay_seconds: 30.0,
            jitter: 0.2,
        }
    }
}

impl RetrySettings {
    /// Backoff before the first retry; negative values clamp to zero.
    pub fn base_delay(&self) -> Duration {
        Duration::from_secs_f64(self.base_delay_seconds.max(0.0))
    }

    /// Backoff ceiling; negative values clamp to zero.
    pub fn max_delay(&self) -> Duration {
        Duration::from_secs_f64(self.max_delay_seconds.max(0.0))
    }
}

/// `[rate_limit]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitSettings {
    /// Requests allowed in any sliding window.
    pub requests_per_window: u32,
    /// Window length.
    pub window_seconds: f64,
    /// Longest a caller may wait for a slot before failing.
    pub max_wait_seconds: f64,
    /// Shrink the budget after 429s and grow it back after successes.
    pub adaptive: bool,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_window: 50,
            window_seconds: 60.0,
            max_wait_seconds: 300.0,
            adaptive: true,
        }
    }
}

impl RateLimitSettings {
    /// Window length; negative values clamp to zero.
    pub fn window(&self) -> Duration {
        Duration::from_secs_f64(self.window_seconds.max(0.0))
    }

    /// Wait ceiling; negative values clamp to zero.
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs_f64(self.max_wait_seconds.max(0.0))
    }
}

/// `[llm.command]`: program used by the `command` provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommandSettings {
    /// Executable to spawn.
    pub program: String,
    /// Arguments passed before any provider-specific ones.
    pub args: Vec<String>,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            program: "llm".to_string(),
            args: Vec::new(),
        }
    }
}

/// `[llm]`: the default client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientSettings {
    /// Provider family.
    pub provider: ProviderKind,
    /// Model identifier.
    pub model: String,
    /// Sampling temperature in `[0, 2]`.
    pub temperature: f32,
    /// Output token ceiling.
    pub max_tokens: u32,
    /// Name of the environment variable holding the API key.
    pub credential: Option<String>,
    /// Per-call timeout.
    pub timeout_seconds: u64,
    /// Settings for the `command` provider.
    pub command: CommandSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Command,
            model: "default".to_string(),
            temperature: 0.7,
            max_tokens: 4096,
            credential: None,
            timeout_seconds: 300,
            command: CommandSettings::default(),
        }
    }
}

/// `[stages.<stage>]`: optional per-stage overrides of [`ClientSettings`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StageOverride {
    /// Provider override.
    pub provider: Option<ProviderKind>,
    /// Model override.
    pub model: Option<String>,
    /// Temperature override.
    pub temperature: Option<f32>,
    /// Token ceiling override.
    pub max_tokens: Option<u32>,
    /// Credential variable override.
    pub credential: Option<String>,
    /// Timeout override.
    pub timeout_seconds: Option<u64>,
    /// Command override.
    pub command: Option<CommandSettings>,
}

/// `[checkpoint]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckpointSettings {
    /// Root directory of the filesystem store.
    pub directory: PathBuf,
    /// Retention applied by the `cleanup` command when no flag is given.
    pub keep_latest: Option<usize>,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(".planforge/checkpoints"),
            keep_latest: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Root
// ---------------------------------------------------------------------------

/// The complete pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Upper bound on in-flight LLM calls.
    pub max_concurrent_requests: usize,
    /// Correction loop iteration cap.
    pub max_correction_iterations: u32,
    /// Correction loop stagnation detection.
    pub stagnation: StagnationPolicy,
    /// Retry policy.
    pub retry: RetrySettings,
    /// Rate limiting.
    pub rate_limit: RateLimitSettings,
    /// Default LLM client.
    pub llm: ClientSettings,
    /// Per-stage client overrides keyed by stage name.
    pub stages: BTreeMap<String, StageOverride>,
    /// Checkpoint storage.
    pub checkpoint: CheckpointSettings,
    /// Design validator vocabulary.
    pub validator: ValidatorConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            max_correction_iterations: DEFAULT_MAX_CORRECTION_ITERATIONS,
            stagnation: StagnationPolicy::default(),
            retry: RetrySettings::default(),
            rate_limit: RateLimitSettings::default(),
            llm: ClientSettings::default(),
            stages: BTreeMap::new(),
            checkpoint: CheckpointSettings::default(),
            validator: ValidatorConfig::default(),
        }
    }
}

/// Effective client settings for one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedClient {
    /// Stage the settings apply to.
    pub stage: Stage,
    /// Provider family.
    pub provider: ProviderKind,
    /// Model identifier.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Output token ceiling.
    pub max_tokens: u32,
    /// Name of the credential environment variable.
    pub credential: Option<String>,
    /// Per-call timeout.
    pub timeout: Duration,
    /// Settings for the `command` provider.
    pub command: CommandSettings,
}

impl ResolvedClient {
    /// Key under which calls share a rate budget: one budget per provider and credential.
    pub fn budget_key(&self) -> (ProviderKind, Option<String>) {
        (self.provider, self.credential.clone())
    }
}

impl PipelineConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, PlanforgeError> {
        let config: Self = toml::from_str(source)
            .map_err(|e| PlanforgeError::configuration(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every constraint the pipeline relies on.
    ///
    /// All problems are reported together in one [`PlanforgeError::Configuration`].
    pub fn validate(&self) -> Result<(), PlanforgeError> {
        let mut problems = Vec::new();

        if self.max_concurrent_requests == 0 {
            problems.push("max_concurrent_requests must be at least 1".to_string());
        }
        if self.retry.max_attempts == 0 {
            problems.push("retry.max_attempts must be at least 1".to_string());
        }
        if !(self.retry.base_delay_seconds >= 0.0 && self.retry.base_delay_seconds.is_finite()) {
            problems.push("retry.base_delay_seconds must be a non-negative number".to_string());
        }
        if !(self.retry.max_delay_seconds >= self.retry.base_delay_seconds
            && self.retry.max_delay_seconds.is_finite())
        {
            problems.push("retry.max_delay_seconds must be at least base_delay_seconds".to_string());
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            problems.push("retry.jitter must be within [0, 1]".to_string());
        }
        if self.rate_limit.requests_per_window == 0 {
            problems.push("rate_limit.requests_per_window must be at least 1".to_string());
        }
        if !(self.rate_limit.window_seconds > 0.0 && self.rate_limit.window_seconds.is_finite()) {
            problems.push("rate_limit.window_seconds must be positive".to_string());
        }
        if !(self.rate_limit.max_wait_seconds >= 0.0 && self.rate_limit.max_wait_seconds.is_finite()) {
            problems.push("rate_limit.max_wait_seconds must be a non-negative number".to_string());
        }

        let default_client = self.merge(Stage::Design, &StageOverride::default());
        check_resolved("llm", &default_client, &mut problems);
        for (key, stage_override) in &self.stages {
            match Stage::parse(key) {
                Some(stage) => {
                    let merged = self.merge(stage, stage_override);
                    check_resolved(&format!("stages.{key}"), &merged, &mut problems);
                }
                None => problems.push(format!("stages.{key} is not a known stage")),
            }
        }

        if let Err(e) = DesignValidator::new(&self.validator) {
            problems.push(format!("validator: {e}"));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(PlanforgeError::configuration(problems.join("; ")))
        }
    }

    /// Merges `[llm]` with `[stages.<stage>]`. Pure and deterministic.
    pub fn resolve_client(&self, stage: Stage) -> ResolvedClient {
        match self.stages.get(stage.as_str()) {
            Some(stage_override) => self.merge(stage, stage_override),
            None => self.merge(stage, &StageOverride::default()),
        }
    }

    fn merge(&self, stage: Stage, o: &StageOverride) -> ResolvedClient {
        let base = &self.llm;
        ResolvedClient {
            stage,
            provider: o.provider.unwrap_or(base.provider),
            model: o.model.clone().unwrap_or_else(|| base.model.clone()),
            temperature: o.temperature.unwrap_or(base.temperature),
            max_tokens: o.max_tokens.unwrap_or(base.max_tokens),
            credential: o.credential.clone().or_else(|| base.credential.clone()),
            timeout: Duration::from_secs(o.timeout_seconds.unwrap_or(base.timeout_seconds)),
            command: o.command.clone().unwrap_or_else(|| base.command.clone()),
        }
    }
}

fn check_resolved(section: &str, client: &ResolvedClient, problems: &mut Vec<String>) {
    if !(0.0..=2.0).contains(&client.temperature) {
        problems.push(format!("{section}.temperature must be within [0, 2]"));
    }
    if client.max_tokens == 0 {
        problems.push(format!("{section}.max_tokens must be at least 1"));
    }
    if client.timeout.is_zero() {
        problems.push(format!("{section}.timeout_seconds must be at least 1"));
    }
    if client.provider == ProviderKind::Command && client.command.program.trim().is_empty() {
        problems.push(format!("{section}: provider 'command' requires command.program"));
    }
}
