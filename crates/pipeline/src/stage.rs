//! Stages, stage results, and the run state machine record.
//!
//! A run advances strictly sequentially through
//! `interview → complexity → design → validate → (correct)* → devplan →
//! phase_expansion → handoff`. Every stage execution, including each
//! correction iteration, appends a new [`StageResult`]; results are never
//! mutated after they are recorded.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    ComplexityProfile, CorrectionIteration, ErrorKind, IssueCode, PlanforgeError, RunId,
    SanityReviewResult, Timestamp, ValidationReport,
};

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// One named step of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Capture of the requirements interview (input only, no LLM call).
    Interview,
    /// Complexity estimation producing the [`ComplexityProfile`].
    Complexity,
    /// Design document generation.
    Design,
    /// Rule-based validation plus semantic sanity review.
    Validate,
    /// One iteration of the correction loop.
    Correct,
    /// Development plan generation.
    Devplan,
    /// Concurrent per-phase expansion of the development plan.
    PhaseExpansion,
    /// Handoff document generation.
    Handoff,
}

impl Stage {
    /// Every stage in pipeline order.
    pub const ALL: [Stage; 8] = [
        Stage::Interview,
        Stage::Complexity,
        Stage::Design,
        Stage::Validate,
        Stage::Correct,
        Stage::Devplan,
        Stage::PhaseExpansion,
        Stage::Handoff,
    ];

    /// Returns the canonical snake_case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interview => "interview",
            Self::Complexity => "complexity",
            Self::Design => "design",
            Self::Validate => "validate",
            Self::Correct => "correct",
            Self::Devplan => "devplan",
            Self::PhaseExpansion => "phase_expansion",
            Self::Handoff => "handoff",
        }
    }

    /// Parses a canonical stage name.
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }

    /// Position of the stage in pipeline order (0-based).
    pub fn ordinal(self) -> usize {
        self as usize
    }

    /// The unconditional successor of this stage.
    ///
    /// `validate` proceeds to `devplan` here; entering `correct` instead is a
    /// guarded transition decided by the orchestrator from the validation
    /// report. `handoff` has no successor.
    pub fn next(self) -> Option<Stage> {
        match self {
            Self::Interview => Some(Self::Complexity),
            Self::Complexity => Some(Self::Design),
            Self::Design => Some(Self::Validate),
            Self::Validate | Self::Correct => Some(Self::Devplan),
            Self::Devplan => Some(Self::PhaseExpansion),
            Self::PhaseExpansion => Some(Self::Handoff),
            Self::Handoff => None,
        }
    }

    /// Returns `true` if executing this stage issues LLM calls.
    pub fn uses_llm(self) -> bool {
        !matches!(self, Self::Interview)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Known risks
// ---------------------------------------------------------------------------

/// Where a known risk was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskSource {
    /// Hidden risk listed by the complexity estimate.
    Complexity,
    /// Validation issue that was not auto-correctable.
    Validation,
    /// Issue left unresolved by the correction loop.
    Correction,
    /// Risk raised by the semantic sanity review.
    SanityReview,
}

/// A risk carried forward into the handoff document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownRisk {
    /// Where the risk came from.
    pub source: RiskSource,
    /// Issue code, when the risk originates from a validation issue.
    pub code: Option<IssueCode>,
    /// Human-readable description.
    pub description: String,
}

// ---------------------------------------------------------------------------
// Stage results
// ---------------------------------------------------------------------------

/// Typed output attached to a [`StageResult`] for downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuredOutput {
    /// Output of the complexity stage.
    Complexity(ComplexityProfile),
    /// Output of the validate stage.
    Validation {
        /// Merged rule-based and review report.
        report: ValidationReport,
        /// The semantic review, when one was performed.
        review: Option<SanityReviewResult>,
    },
    /// Output of one correction iteration.
    Correction(CorrectionIteration),
    /// Phase documents keyed by phase number.
    Phases(BTreeMap<u32, String>),
    /// Output of the handoff stage.
    Handoff {
        /// Risks appended to the handoff document.
        known_risks: Vec<KnownRisk>,
    },
}

/// Error information recorded on a failed or cancelled stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    /// Taxonomy bucket.
    pub kind: ErrorKind,
    /// Human-readable message (the canonical explanation surfaced upward).
    pub message: String,
}

impl From<PlanforgeError> for StageError {
    fn from(error: PlanforgeError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// The record of one stage execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage that ran.
    pub stage: Stage,
    /// Document or markdown text produced (possibly partial on failure).
    pub raw_output: String,
    /// Parsed model for downstream consumers, when the stage produces one.
    pub structured_output: Option<StructuredOutput>,
    /// When execution started.
    pub started_at: Timestamp,
    /// When execution ended (successfully or not).
    pub completed_at: Timestamp,
    /// Retries performed beyond the first attempt.
    pub retry_count: u32,
    /// Present when the stage failed or was cancelled. A completed stage
    /// carries a [`ErrorKind::ValidationFailure`] here when the design it
    /// leaves behind still fails validation.
    pub error: Option<StageError>,
}

impl StageResult {
    /// Creates a successful result.
    pub fn succeeded(
        stage: Stage,
        started_at: Timestamp,
        raw_output: impl Into<String>,
        structured_output: Option<StructuredOutput>,
        retry_count: u32,
    ) -> Self {
        Self {
            stage,
            raw_output: raw_output.into(),
            structured_output,
            started_at,
            completed_at: Timestamp::now(),
            retry_count,
            error: None,
        }
    }

    /// Creates a failed (or cancelled) result, preserving any partial output.
    pub fn failed(
        stage: Stage,
        started_at: Timestamp,
        partial_output: impl Into<String>,
        error: StageError,
        retry_count: u32,
    ) -> Self {
        Self {
            stage,
            raw_output: partial_output.into(),
            structured_output: None,
            started_at,
            completed_at: Timestamp::now(),
            retry_count,
            error: Some(error),
        }
    }

    /// Returns `true` if the stage completed, possibly with unresolved
    /// validation issues.
    pub fn is_success(&self) -> bool {
        self.error
            .as_ref()
            .map_or(true, |e| e.kind == ErrorKind::ValidationFailure)
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Stages are executing.
    Running,
    /// Stopped between stages; resumable.
    Paused,
    /// Every stage completed.
    Completed,
    /// A stage failed; the last checkpoint remains resumable.
    Failed,
    /// Cancelled by the user; the last checkpoint remains resumable.
    Cancelled,
}

impl RunStatus {
    /// Returns `true` for statuses after which no further stage runs.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One execution session of a run and the stage results it produced.
///
/// A resumed run reuses the same [`RunId`]; its `results` list only holds the
/// stages executed in this session and `resumed_from` names the stage it
/// restarted at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Run identity.
    pub run_id: RunId,
    /// Stage results in execution order.
    pub results: Vec<StageResult>,
    /// Stage currently executing, or the last one attempted.
    pub current_stage: Option<Stage>,
    /// Lifecycle status.
    pub status: RunStatus,
    /// Stage execution restarted at, when this session is a resume.
    pub resumed_from: Option<Stage>,
}

impl PipelineRun {
    /// Starts a new running session.
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            results: Vec::new(),
            current_stage: None,
            status: RunStatus::Running,
            resumed_from: None,
        }
    }

    /// Starts a running session that resumes at `stage`.
    pub fn resumed(run_id: RunId, stage: Stage) -> Self {
        Self {
            resumed_from: Some(stage),
            ..Self::new(run_id)
        }
    }

    /// Appends a stage result. Results are append-only.
    pub fn record(&mut self, result: StageResult) {
        self.current_stage = Some(result.stage);
        self.results.push(result);
    }

    /// The most recently recorded result.
    pub fn last_result(&self) -> Option<&StageResult> {
        self.results.last()
    }

    /// The stages executed in this session, in order, with consecutive repeats collapsed.
    pub fn executed_stages(&self) -> Vec<Stage> {
        let mut stages: Vec<Stage> = Vec::new();
        for result in &self.results {
            if stages.last() != Some(&result.stage) {
                stages.push(result.stage);
            }
        }
        stages
    }

    /// Total retries performed across every recorded result.
    pub fn total_retries(&self) -> u32 {
        self.results.iter().map(|r| r.retry_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolved_validation_still_counts_as_success() {
        let started = Timestamp::now();
        let mut result = StageResult::succeeded(Stage::Correct, started, "design", None, 0);
        result.error = Some(PlanforgeError::ValidationFailure { unresolved: 1 }.into());
        assert!(result.is_success());
        assert_eq!(
            result.error.as_ref().map(|e| e.message.as_str()),
            Some("Design has 1 unresolved validation issue(s)")
        );

        let cancelled = StageResult::failed(
            Stage::Correct,
            started,
            "",
            StageError {
                kind: ErrorKind::Cancelled,
                message: "cancelled".into(),
            },
            0,
        );
        assert!(!cancelled.is_success());
    }

    #[test]
    fn stage_names_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(Stage::parse("deploy"), None);
    }

    #[test]
    fn stage_successors_follow_pipeline_order() {
        assert_eq!(Stage::Interview.next(), Some(Stage::Complexity));
        assert_eq!(Stage::Validate.next(), Some(Stage::Devplan));
        assert_eq!(Stage::Correct.next(), Some(Stage::Devplan));
        assert_eq!(Stage::Handoff.next(), None);
        assert!(Stage::Design.ordinal() < Stage::Devplan.ordinal());
    }

    #[test]
    fn executed_stages_collapses_repeats() {
        let mut run = PipelineRun::new(RunId::new_random());
        let now = Timestamp::now();
        for stage in [Stage::Correct, Stage::Correct, Stage::Validate] {
            run.record(StageResult::succeeded(stage, now, "", None, 1));
        }
        assert_eq!(run.executed_stages(), vec![Stage::Correct, Stage::Validate]);
        assert_eq!(run.total_retries(), 3);
        assert_eq!(run.current_stage, Some(Stage::Validate));
    }

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
    }
}
