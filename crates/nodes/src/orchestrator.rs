//! The pipeline state machine.
//!
//! ```text
//! interview → complexity → design → validate ─┬─────────────→ devplan → phase_expansion → handoff
//!                                             └→ correct* ──┘
//! ```
//!
//! Stages run strictly one after another. After every stage the run snapshot
//! is checkpointed, so a failed or cancelled run can be resumed from the last
//! stage that completed. Every stage failure is caught here and recorded as a
//! failed [`StageResult`]; nothing below this boundary can end the process.

use std::collections::BTreeMap;
use std::sync::Arc;

use llm::{ConcurrencyManager, LlmClientFactory, RateLimitConfig, RateLimiter, RetryPolicy};
use pipeline::{
    CheckpointError, CheckpointRecord, CheckpointStore, CollaboratorError,
    ComplexityEstimator, ComplexityProfile, CorrectionLoop, DesignCorrector, DesignValidator,
    ErrorKind, KnownRisk, LlmError, PipelineConfig, PipelineRun, PlanforgeError, ProviderKind,
    RiskSource, RunId, RunSnapshot, RunStatus, SanityReviewer, Severity, Stage, StageError, StageResult,
    StopReason, StructuredOutput, Timestamp, ValidationReport,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, instrument, warn, Instrument};

use crate::collaborators::{LlmComplexityEstimator, LlmDesignCorrector, LlmSanityReviewer};
use crate::gateway::{Completion, GatewayError, LlmGateway};
use crate::phases::{expand_phases, render_phases};
use crate::prompts;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles a [`PipelineOrchestrator`].
///
/// Collaborators that are not overridden are LLM-backed and get a gateway of
/// their own stage; overridden ones need no client at all.
pub struct OrchestratorBuilder {
    config: Arc<PipelineConfig>,
    store: Arc<dyn CheckpointStore>,
    factory: LlmClientFactory,
    estimator: Option<Arc<dyn ComplexityEstimator>>,
    reviewer: Option<Arc<dyn SanityReviewer>>,
    corrector: Option<Arc<dyn DesignCorrector>>,
    validator: Option<Arc<DesignValidator>>,
    cancel: CancellationToken,
}

impl OrchestratorBuilder {
    /// Uses `estimator` instead of the LLM-backed one.
    #[must_use]
    pub fn estimator(mut self, estimator: Arc<dyn ComplexityEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Uses `reviewer` instead of the LLM-backed one.
    #[must_use]
    pub fn reviewer(mut self, reviewer: Arc<dyn SanityReviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    /// Uses `corrector` instead of the LLM-backed one.
    #[must_use]
    pub fn corrector(mut self, corrector: Arc<dyn DesignCorrector>) -> Self {
        self.corrector = Some(corrector);
        self
    }

    /// Uses `validator` instead of one built from the `[validator]` section.
    #[must_use]
    pub fn validator(mut self, validator: Arc<DesignValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Shares an existing cancellation token with the orchestrator.
    #[must_use]
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Validates the configuration and constructs one gateway per LLM stage.
    ///
    /// Stages sharing a provider and credential share one rate limiter; every
    /// gateway shares the run-wide concurrency manager.
    pub fn build(self) -> Result<PipelineOrchestrator, PlanforgeError> {
        let config = self.config;
        config.validate()?;

        let validator = match self.validator {
            Some(validator) => validator,
            None => Arc::new(
                DesignValidator::new(&config.validator)
                    .map_err(|e| PlanforgeError::configuration(e.to_string()))?,
            ),
        };
        let concurrency = ConcurrencyManager::new(config.max_concurrent_requests).ok_or_else(|| {
            PlanforgeError::configuration("max_concurrent_requests must be at least 1")
        })?;
        let retry = RetryPolicy::from_settings(&config.retry);
        let rate_config = RateLimitConfig::from_settings(&config.rate_limit);

        let mut needed = vec![Stage::Design, Stage::Devplan, Stage::PhaseExpansion, Stage::Handoff];
        if self.estimator.is_none() {
            needed.push(Stage::Complexity);
        }
        if self.reviewer.is_none() {
            needed.push(Stage::Validate);
        }
        if self.corrector.is_none() {
            needed.push(Stage::Correct);
        }
        needed.sort();

        let mut limiters: BTreeMap<(ProviderKind, Option<String>), Arc<RateLimiter>> = BTreeMap::new();
        let mut gateways = BTreeMap::new();
        for stage in needed {
            let settings = config.resolve_client(stage);
            let client = self.factory.build(&settings).map_err(|e| match e {
                LlmError::Authentication(message) => PlanforgeError::Credentials { message },
                other => PlanforgeError::configuration(other.to_string()),
            })?;
            let limiter = Arc::clone(
                limiters
                    .entry(settings.budget_key())
                    .or_insert_with(|| Arc::new(RateLimiter::new(rate_config))),
            );
            info!(
                stage = %stage,
                provider = %settings.provider,
                model = %settings.model,
                client = client.name(),
                "Stage client ready"
            );
            let gateway = LlmGateway::new(
                client,
                settings,
                limiter,
                concurrency.clone(),
                retry.clone(),
                self.cancel.clone(),
            );
            gateways.insert(stage, Arc::new(gateway));
        }

        let llm_gateway = |stage: Stage| {
            gateways.get(&stage).cloned().ok_or_else(|| {
                PlanforgeError::configuration(format!("no client configured for stage {stage}"))
            })
        };
        let estimator: Arc<dyn ComplexityEstimator> = match self.estimator {
            Some(estimator) => estimator,
            None => Arc::new(LlmComplexityEstimator::new(llm_gateway(Stage::Complexity)?)),
        };
        let reviewer: Arc<dyn SanityReviewer> = match self.reviewer {
            Some(reviewer) => reviewer,
            None => Arc::new(LlmSanityReviewer::new(llm_gateway(Stage::Validate)?)),
        };
        let corrector: Arc<dyn DesignCorrector> = match self.corrector {
            Some(corrector) => corrector,
            None => Arc::new(LlmDesignCorrector::new(llm_gateway(Stage::Correct)?)),
        };

        Ok(PipelineOrchestrator {
            config,
            store: self.store,
            gateways,
            estimator,
            reviewer,
            corrector,
            validator,
            cancel: self.cancel,
        })
    }
}

// ---------------------------------------------------------------------------
// Stage plumbing
// ---------------------------------------------------------------------------

/// Output of one stage execution before timestamps and retries are attached.
struct Produced {
    raw_output: String,
    structured_output: Option<StructuredOutput>,
}

impl Produced {
    fn new(raw_output: impl Into<String>, structured_output: Option<StructuredOutput>) -> Self {
        Self {
            raw_output: raw_output.into(),
            structured_output,
        }
    }
}

/// What a successful stage hands back to the loop.
struct Executed {
    produced: Vec<Produced>,
    next: Option<Stage>,
    /// Recorded on the last result when the design still fails validation.
    unresolved: Option<StageError>,
}

/// A stage that could not finish.
#[derive(Debug)]
struct StageFailure {
    error: StageError,
    partial_output: String,
    structured_output: Option<StructuredOutput>,
}

impl StageFailure {
    fn fatal(message: impl Into<String>) -> Self {
        Self {
            error: StageError {
                kind: ErrorKind::Fatal,
                message: message.into(),
            },
            partial_output: String::new(),
            structured_output: None,
        }
    }

    fn cancelled() -> Self {
        Self {
            error: StageError {
                kind: ErrorKind::Cancelled,
                message: "run cancelled".to_string(),
            },
            partial_output: String::new(),
            structured_output: None,
        }
    }
}

impl From<CollaboratorError> for StageFailure {
    fn from(error: CollaboratorError) -> Self {
        Self {
            error: StageError {
                kind: error.kind(),
                message: error.to_string(),
            },
            partial_output: error.partial_output().to_string(),
            structured_output: None,
        }
    }
}

impl From<GatewayError> for StageFailure {
    fn from(error: GatewayError) -> Self {
        CollaboratorError::from(error).into()
    }
}

fn require<'a, T>(value: Option<&'a T>, what: &str) -> Result<&'a T, StageFailure> {
    value.ok_or_else(|| StageFailure::fatal(format!("{what} is missing from the run state")))
}

fn push_risk(risks: &mut Vec<KnownRisk>, risk: KnownRisk) {
    if !risks.contains(&risk) {
        risks.push(risk);
    }
}

fn source_label(source: RiskSource) -> &'static str {
    match source {
        RiskSource::Complexity => "complexity",
        RiskSource::Validation => "validation",
        RiskSource::Correction => "correction",
        RiskSource::SanityReview => "sanity review",
    }
}

/// The non-fatal [`ErrorKind::ValidationFailure`] recorded when `report`
/// still fails validation.
fn validation_failure(report: &ValidationReport) -> Option<StageError> {
    if report.is_valid {
        return None;
    }
    let unresolved = report
        .issues
        .iter()
        .filter(|i| i.severity == Severity::Error)
        .count();
    Some(PlanforgeError::ValidationFailure { unresolved }.into())
}

/// The `## Known Risks` section appended to every handoff document.
pub fn known_risks_section(risks: &[KnownRisk]) -> String {
    let mut out = String::from("## Known Risks\n\n");
    if risks.is_empty() {
        out.push_str("No known risks were recorded.\n");
        return out;
    }
    for risk in risks {
        match &risk.code {
            Some(code) => out.push_str(&format!(
                "- [{}] `{code}`: {}\n",
                source_label(risk.source),
                risk.description
            )),
            None => out.push_str(&format!("- [{}] {}\n", source_label(risk.source), risk.description)),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives runs through the stage machine.
///
/// One orchestrator advances a given run at a time; checkpoint stores rely on
/// that single-writer assumption. Once cancelled, an orchestrator stays
/// cancelled.
pub struct PipelineOrchestrator {
    config: Arc<PipelineConfig>,
    store: Arc<dyn CheckpointStore>,
    gateways: BTreeMap<Stage, Arc<LlmGateway>>,
    estimator: Arc<dyn ComplexityEstimator>,
    reviewer: Arc<dyn SanityReviewer>,
    corrector: Arc<dyn DesignCorrector>,
    validator: Arc<DesignValidator>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("gateways", &self.gateways.keys().collect::<Vec<_>>())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl PipelineOrchestrator {
    /// Starts building an orchestrator.
    pub fn builder(
        config: Arc<PipelineConfig>,
        store: Arc<dyn CheckpointStore>,
        factory: LlmClientFactory,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            store,
            factory,
            estimator: None,
            reviewer: None,
            corrector: None,
            validator: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Stops issuing LLM calls. In-flight calls observe the token and return
    /// with whatever output they streamed.
    pub fn cancel(&self) {
        info!("Cancellation requested");
        self.cancel.cancel();
    }

    /// The token [`Self::cancel`] triggers.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs a new pipeline over `interview`.
    pub async fn run(&self, interview: &str) -> PipelineRun {
        self.run_with_id(RunId::new_random(), interview).await
    }

    /// Runs a new pipeline under a caller-chosen id.
    pub async fn run_with_id(&self, run_id: RunId, interview: &str) -> PipelineRun {
        let mut run = PipelineRun::new(run_id);
        self.drive(&mut run, RunSnapshot::new(interview), Stage::Interview)
            .await;
        run
    }

    /// Continues a run from its newest readable checkpoint.
    ///
    /// A corrupted latest record is skipped in favour of the one before it.
    /// Fails with [`PlanforgeError::CheckpointCorrupted`] when no record of the
    /// run can be read.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn resume(&self, run_id: RunId) -> Result<PipelineRun, PlanforgeError> {
        let record = self.newest_readable(run_id).await?;
        let snapshot = record.state;
        let Some(stage) = snapshot.next_stage else {
            info!(sequence = record.sequence, "Run already completed; nothing to resume");
            let mut run = PipelineRun::new(run_id);
            run.current_stage = snapshot.furthest_stage();
            run.status = RunStatus::Completed;
            return Ok(run);
        };
        info!(
            sequence = record.sequence,
            checkpoint_stage = %record.stage,
            resume_at = %stage,
            "Resuming run"
        );
        let mut run = PipelineRun::resumed(run_id, stage);
        self.drive(&mut run, snapshot, stage).await;
        Ok(run)
    }

    async fn newest_readable(&self, run_id: RunId) -> Result<CheckpointRecord, PlanforgeError> {
        let corrupted = match self.store.load_latest(run_id).await {
            Ok(record) => return Ok(record),
            Err(CheckpointError::Corrupted { sequence, reason, .. }) => {
                warn!(sequence, reason = %reason, "Latest checkpoint is corrupted; walking back");
                (sequence, reason)
            }
            Err(other) => return Err(other.into()),
        };

        let entries = self.store.list(run_id).await?;
        for entry in entries.iter().rev().filter(|e| e.sequence < corrupted.0) {
            match self.store.load(run_id, entry.sequence).await {
                Ok(record) => return Ok(record),
                Err(CheckpointError::Corrupted { sequence, reason, .. }) => {
                    warn!(sequence, reason = %reason, "Checkpoint is corrupted; walking back");
                }
                Err(other) => return Err(other.into()),
            }
        }
        Err(PlanforgeError::CheckpointCorrupted {
            run_id,
            sequence: corrupted.0,
            reason: corrupted.1,
        })
    }

    #[instrument(skip_all, fields(run_id = %run.run_id))]
    async fn drive(&self, run: &mut PipelineRun, mut snapshot: RunSnapshot, start: Stage) {
        let run_id = run.run_id;
        let mut next = Some(start);

        while let Some(stage) = next {
            run.current_stage = Some(stage);
            let started_at = Timestamp::now();
            let retries_before = self.retries(stage);

            let outcome = if self.cancel.is_cancelled() {
                Err(StageFailure::cancelled())
            } else {
                self.execute(stage, &mut snapshot)
                    .instrument(info_span!("stage", stage = %stage))
                    .await
            };
            let retry_count = self.retries(stage).saturating_sub(retries_before);

            match outcome {
                Ok(executed) => {
                    let count = executed.produced.len();
                    let mut unresolved = executed.unresolved;
                    for (index, produced) in executed.produced.into_iter().enumerate() {
                        // Retries and unresolved issues are reported on the stage's last result.
                        let last = index + 1 == count;
                        let retries = if last { retry_count } else { 0 };
                        let mut result = StageResult::succeeded(
                            stage,
                            started_at,
                            produced.raw_output,
                            produced.structured_output,
                            retries,
                        );
                        if last {
                            result.error = unresolved.take();
                        }
                        snapshot.last_result = Some(result.clone());
                        run.record(result);
                    }
                    snapshot.completed.push(stage);
                    snapshot.next_stage = executed.next;

                    if let Err(e) = self.store.save(run_id, stage, &snapshot).await {
                        error!(stage = %stage, error = %e, "Checkpoint save failed");
                        let result = StageResult::failed(
                            stage,
                            started_at,
                            String::new(),
                            StageError {
                                kind: ErrorKind::Fatal,
                                message: format!("checkpoint save failed: {e}"),
                            },
                            0,
                        );
                        run.record(result);
                        run.status = RunStatus::Failed;
                        return;
                    }
                    info!(stage = %stage, retries = retry_count, "Stage completed");
                    next = executed.next;
                }
                Err(failure) => {
                    let status = if failure.error.kind == ErrorKind::Cancelled {
                        RunStatus::Cancelled
                    } else {
                        RunStatus::Failed
                    };
                    warn!(
                        stage = %stage,
                        kind = %failure.error.kind,
                        error = %failure.error.message,
                        retries = retry_count,
                        "Stage did not complete"
                    );
                    let mut result = StageResult::failed(
                        stage,
                        started_at,
                        failure.partial_output,
                        failure.error,
                        retry_count,
                    );
                    result.structured_output = failure.structured_output;
                    snapshot.last_result = Some(result.clone());
                    snapshot.next_stage = Some(stage);
                    run.record(result);
                    run.status = status;

                    // Handlers keep only reusable progress (finished phases) in
                    // the snapshot when they fail; resume re-runs `stage`.
                    if let Err(e) = self.store.save(run_id, stage, &snapshot).await {
                        warn!(stage = %stage, error = %e, "Could not checkpoint failed stage");
                    }
                    return;
                }
            }
        }

        run.status = RunStatus::Completed;
        info!(retries = run.total_retries(), "Run completed");
    }

    fn retries(&self, stage: Stage) -> u32 {
        self.gateways.get(&stage).map_or(0, |g| g.total_retries())
    }

    fn gateway(&self, stage: Stage) -> Result<&LlmGateway, StageFailure> {
        self.gateways
            .get(&stage)
            .map(Arc::as_ref)
            .ok_or_else(|| StageFailure::fatal(format!("no client configured for stage {stage}")))
    }

    async fn complete(
        &self,
        stage: Stage,
        profile: &ComplexityProfile,
        prompt: &str,
    ) -> Result<Completion, StageFailure> {
        let template = prompts::template_for(stage, profile.depth_level);
        Ok(self.gateway(stage)?.complete(&template, prompt).await?)
    }

    async fn execute(&self, stage: Stage, snapshot: &mut RunSnapshot) -> Result<Executed, StageFailure> {
        match stage {
            Stage::Interview => self.interview(snapshot),
            Stage::Complexity => self.complexity(snapshot).await,
            Stage::Design => self.design(snapshot).await,
            Stage::Validate => self.validate(snapshot).await,
            Stage::Correct => self.correct(snapshot).await,
            Stage::Devplan => self.devplan(snapshot).await,
            Stage::PhaseExpansion => self.phase_expansion(snapshot).await,
            Stage::Handoff => self.handoff(snapshot).await,
        }
    }

    fn interview(&self, snapshot: &mut RunSnapshot) -> Result<Executed, StageFailure> {
        if snapshot.interview.trim().is_empty() {
            return Err(StageFailure::fatal("interview text is empty"));
        }
        Ok(Executed {
            produced: vec![Produced::new(snapshot.interview.clone(), None)],
            next: Stage::Interview.next(),
            unresolved: None,
        })
    }

    async fn complexity(&self, snapshot: &mut RunSnapshot) -> Result<Executed, StageFailure> {
        let profile = self.estimator.estimate(&snapshot.interview).await?;
        info!(
            score = profile.score,
            depth = %profile.depth_level,
            phases = profile.estimated_phase_count,
            "Complexity estimated"
        );
        for hidden in &profile.hidden_risks {
            push_risk(
                &mut snapshot.known_risks,
                KnownRisk {
                    source: RiskSource::Complexity,
                    code: None,
                    description: hidden.clone(),
                },
            );
        }
        let raw = serde_json::to_string_pretty(&profile)
            .map_err(|e| StageFailure::fatal(format!("encoding profile: {e}")))?;
        snapshot.profile = Some(profile.clone());
        Ok(Executed {
            produced: vec![Produced::new(raw, Some(StructuredOutput::Complexity(profile)))],
            next: Stage::Complexity.next(),
            unresolved: None,
        })
    }

    async fn design(&self, snapshot: &mut RunSnapshot) -> Result<Executed, StageFailure> {
        let profile = require(snapshot.profile.as_ref(), "complexity profile")?;
        let completion = self
            .complete(Stage::Design, profile, &prompts::design(&snapshot.interview, profile))
            .await?;
        snapshot.design = Some(completion.text.clone());
        Ok(Executed {
            produced: vec![Produced::new(completion.text, None)],
            next: Stage::Design.next(),
            unresolved: None,
        })
    }

    async fn validate(&self, snapshot: &mut RunSnapshot) -> Result<Executed, StageFailure> {
        let profile = require(snapshot.profile.as_ref(), "complexity profile")?;
        let design = require(snapshot.design.as_ref(), "design")?;

        let rules = self.validator.validate(design, profile);
        let review = self.reviewer.review(design, &rules, profile).await?;
        let report = rules.with_review(&review);
        info!(
            valid = report.is_valid,
            issues = report.issues.len(),
            assessment = ?review.overall_assessment,
            "Design validated"
        );

        for issue in report.uncorrectable_issues() {
            push_risk(
                &mut snapshot.known_risks,
                KnownRisk {
                    source: RiskSource::Validation,
                    code: Some(issue.code.clone()),
                    description: issue.message.clone(),
                },
            );
        }
        for risk in &review.risks {
            push_risk(
                &mut snapshot.known_risks,
                KnownRisk {
                    source: RiskSource::SanityReview,
                    code: None,
                    description: risk.clone(),
                },
            );
        }

        let next = if report.needs_correction() && self.config.max_correction_iterations > 0 {
            Stage::Correct
        } else {
            Stage::Devplan
        };
        // Correction owns the verdict when it runs.
        let unresolved = match next {
            Stage::Devplan => validation_failure(&report),
            _ => None,
        };
        let raw = serde_json::to_string_pretty(&report)
            .map_err(|e| StageFailure::fatal(format!("encoding report: {e}")))?;
        snapshot.validation = Some(report.clone());
        snapshot.review = Some(review.clone());
        Ok(Executed {
            produced: vec![Produced::new(
                raw,
                Some(StructuredOutput::Validation {
                    report,
                    review: Some(review),
                }),
            )],
            next: Some(next),
            unresolved,
        })
    }

    async fn correct(&self, snapshot: &mut RunSnapshot) -> Result<Executed, StageFailure> {
        let profile = require(snapshot.profile.as_ref(), "complexity profile")?.clone();
        let design = require(snapshot.design.as_ref(), "design")?.clone();
        let report = require(snapshot.validation.as_ref(), "validation report")?;
        let issues = report.correctable_issues();

        let outcome = CorrectionLoop::new(&self.validator, self.corrector.as_ref())
            .with_stagnation(self.config.stagnation)
            .run(&design, issues, &profile, self.config.max_correction_iterations)
            .await;

        if let Some(error) = &outcome.error {
            if error.kind() == ErrorKind::Cancelled {
                let mut failure = StageFailure::from(error.clone());
                // Resume restarts the loop from the uncorrected design, so
                // the partial history stays out of the snapshot.
                if let Some(last) = outcome.history.last() {
                    failure.structured_output = Some(StructuredOutput::Correction(last.clone()));
                }
                return Err(failure);
            }
        }
        info!(
            iterations = outcome.history.len(),
            remaining = outcome.remaining_issues.len(),
            stop_reason = ?outcome.stop_reason,
            "Correction finished"
        );

        // Re-validate the final design; review findings the rules cannot see
        // stay open until the change log resolves them.
        let rules = self.validator.validate(&outcome.final_design, &profile);
        let mut issues = rules.issues.clone();
        issues.extend(
            outcome
                .remaining_issues
                .iter()
                .filter(|i| !self.validator.detects(&i.code))
                .cloned(),
        );
        let final_report = ValidationReport::from_parts(rules.checks, issues);
        let unresolved = validation_failure(&final_report);

        for issue in &outcome.remaining_issues {
            push_risk(
                &mut snapshot.known_risks,
                KnownRisk {
                    source: RiskSource::Correction,
                    code: Some(issue.code.clone()),
                    description: issue.message.clone(),
                },
            );
        }
        if let Some(error) = &outcome.error {
            push_risk(
                &mut snapshot.known_risks,
                KnownRisk {
                    source: RiskSource::Correction,
                    code: None,
                    description: format!("Design correction stopped early: {error}"),
                },
            );
        }

        let mut produced: Vec<Produced> = outcome
            .history
            .iter()
            .map(|iteration| {
                Produced::new(
                    iteration.corrected_design.clone(),
                    Some(StructuredOutput::Correction(iteration.clone())),
                )
            })
            .collect();
        if produced.is_empty() {
            // Nothing to correct, or the corrector failed on its first pass.
            produced.push(Produced::new(outcome.final_design.clone(), None));
        }
        if outcome.stop_reason != StopReason::Converged && !outcome.remaining_issues.is_empty() {
            warn!(
                remaining = outcome.remaining_issues.len(),
                "Unresolved issues carried into the handoff as known risks"
            );
        }

        snapshot.corrections.extend(outcome.history);
        snapshot.design = Some(outcome.final_design);
        snapshot.validation = Some(final_report);
        Ok(Executed {
            produced,
            next: Stage::Correct.next(),
            unresolved,
        })
    }

    async fn devplan(&self, snapshot: &mut RunSnapshot) -> Result<Executed, StageFailure> {
        let profile = require(snapshot.profile.as_ref(), "complexity profile")?;
        let design = require(snapshot.design.as_ref(), "design")?;
        let prompt = prompts::devplan(&snapshot.interview, profile, design);
        let completion = self.complete(Stage::Devplan, profile, &prompt).await?;
        snapshot.devplan = Some(completion.text.clone());
        Ok(Executed {
            produced: vec![Produced::new(completion.text, None)],
            next: Stage::Devplan.next(),
            unresolved: None,
        })
    }

    async fn phase_expansion(&self, snapshot: &mut RunSnapshot) -> Result<Executed, StageFailure> {
        let profile = require(snapshot.profile.as_ref(), "complexity profile")?;
        let design = require(snapshot.design.as_ref(), "design")?;
        let devplan = require(snapshot.devplan.as_ref(), "development plan")?;
        let gateway = self.gateway(Stage::PhaseExpansion)?;

        let expansion = expand_phases(gateway, profile, design, devplan, &snapshot.phases).await;
        snapshot.phases = expansion.phases.clone();
        let rendered = render_phases(&expansion.phases);

        if expansion.is_complete() {
            return Ok(Executed {
                produced: vec![Produced::new(rendered, Some(StructuredOutput::Phases(expansion.phases)))],
                next: Stage::PhaseExpansion.next(),
                unresolved: None,
            });
        }

        let failed: Vec<String> = expansion.failures.keys().map(u32::to_string).collect();
        let kind = if expansion
            .failures
            .values()
            .any(|f| f.error == LlmError::Cancelled)
        {
            ErrorKind::Cancelled
        } else {
            expansion
                .failures
                .values()
                .next()
                .map_or(ErrorKind::Fatal, |f| f.error.kind())
        };
        let detail: Vec<String> = expansion
            .failures
            .iter()
            .map(|(number, f)| format!("phase {number}: {f}"))
            .collect();
        Err(StageFailure {
            error: StageError {
                kind,
                message: format!(
                    "phase(s) {} failed: {}",
                    failed.join(", "),
                    detail.join("; ")
                ),
            },
            partial_output: rendered,
            structured_output: Some(StructuredOutput::Phases(expansion.phases)),
        })
    }

    async fn handoff(&self, snapshot: &mut RunSnapshot) -> Result<Executed, StageFailure> {
        let profile = require(snapshot.profile.as_ref(), "complexity profile")?;
        let design = require(snapshot.design.as_ref(), "design")?;
        let devplan = require(snapshot.devplan.as_ref(), "development plan")?;
        let prompt = prompts::handoff(
            profile,
            design,
            devplan,
            snapshot.phases.len(),
            &snapshot.known_risks,
        );
        let completion = self.complete(Stage::Handoff, profile, &prompt).await?;
        let document = format!(
            "{}\n\n{}",
            completion.text.trim_end(),
            known_risks_section(&snapshot.known_risks)
        );
        snapshot.handoff = Some(document.clone());
        Ok(Executed {
            produced: vec![Produced::new(
                document,
                Some(StructuredOutput::Handoff {
                    known_risks: snapshot.known_risks.clone(),
                }),
            )],
            next: None,
            unresolved: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use pipeline::IssueCode;

    use super::*;

    #[test]
    fn risk_section_is_deterministic() {
        let risks = vec![
            KnownRisk {
                source: RiskSource::Correction,
                code: Some(IssueCode::from_static("consistency.multiple_databases")),
                description: "Two primary databases".into(),
            },
            KnownRisk {
                source: RiskSource::SanityReview,
                code: None,
                description: "Single region".into(),
            },
        ];
        assert_eq!(
            known_risks_section(&risks),
            "## Known Risks\n\n\
             - [correction] `consistency.multiple_databases`: Two primary databases\n\
             - [sanity review] Single region\n"
        );
        assert_eq!(
            known_risks_section(&[]),
            "## Known Risks\n\nNo known risks were recorded.\n"
        );
    }

    #[test]
    fn risks_are_recorded_once() {
        let risk = KnownRisk {
            source: RiskSource::Complexity,
            code: None,
            description: "PCI scope".into(),
        };
        let mut risks = Vec::new();
        push_risk(&mut risks, risk.clone());
        push_risk(&mut risks, risk);
        assert_eq!(risks.len(), 1);
    }
}
