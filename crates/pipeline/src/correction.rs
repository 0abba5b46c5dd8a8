//! The bounded validate → correct loop.
//!
//! [`CorrectionLoop`] asks a [`DesignCorrector`] to fix a list of issues, then
//! re-validates the result. A proposal that introduces issue codes absent from
//! its input design is rejected and the design reverts. The loop is a linear
//! chain of [`CorrectionIteration`]s and always terminates: on convergence, on
//! stagnation, at the iteration cap, or when the corrector fails.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    CollaboratorError, ComplexityProfile, Confidence, DesignValidator, IssueCode, ValidationIssue,
};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One edit the corrector reports having made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Issue the edit addresses.
    pub issue_code: IssueCode,
    /// Short description of the edit (e.g. `"removed"`, `"added section"`).
    pub action: String,
    /// Text before the edit.
    #[serde(default)]
    pub before: String,
    /// Text after the edit.
    #[serde(default)]
    pub after: String,
}

/// Record of one correction iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionIteration {
    /// 1-based, strictly increasing within a loop.
    pub iteration_number: u32,
    /// Design handed to the corrector.
    pub input_design: String,
    /// Issues the corrector was asked to fix.
    pub issues_addressed: Vec<ValidationIssue>,
    /// Design after the iteration (equal to the input when rejected).
    pub corrected_design: String,
    /// Edits reported by the corrector.
    pub changes_made: Vec<ChangeRecord>,
    /// Issues still open after the iteration.
    pub remaining_issues: Vec<ValidationIssue>,
    /// Corrector confidence.
    pub confidence: Confidence,
    /// New issue codes that caused the proposal to be rejected.
    #[serde(default)]
    pub rejected_codes: Vec<IssueCode>,
}

impl CorrectionIteration {
    /// Returns `true` if the proposal was rejected.
    pub fn was_rejected(&self) -> bool {
        !self.rejected_codes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Corrector port
// ---------------------------------------------------------------------------

/// Input to one correction attempt.
#[derive(Debug, Clone, Copy)]
pub struct CorrectionRequest<'a> {
    /// Current design.
    pub design: &'a str,
    /// Issues to fix. The corrector must not make unrelated edits.
    pub issues: &'a [ValidationIssue],
    /// Complexity profile of the run.
    pub profile: &'a ComplexityProfile,
    /// 1-based iteration number.
    pub iteration: u32,
}

/// A corrected design proposed by a [`DesignCorrector`].
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionProposal {
    /// Full corrected design text.
    pub corrected_design: String,
    /// Edits made.
    pub changes: Vec<ChangeRecord>,
    /// Corrector confidence.
    pub confidence: Confidence,
}

/// Rewrites a design to fix only the listed issues.
#[async_trait]
pub trait DesignCorrector: Send + Sync {
    /// Proposes a corrected design.
    async fn correct(
        &self,
        request: CorrectionRequest<'_>,
    ) -> Result<CorrectionProposal, CollaboratorError>;
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// How stagnation is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagnationPolicy {
    /// Stop when an iteration leaves the same set of issue codes open as the
    /// iteration before it.
    #[default]
    SetEquality,
    /// Only convergence, the cap, or a corrector failure end the loop.
    Disabled,
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// No issues were given.
    NothingToCorrect,
    /// Every issue was resolved.
    Converged,
    /// Two consecutive iterations left the same issues open.
    Stagnated,
    /// `max_iterations` iterations ran.
    IterationCap,
    /// The corrector returned an error.
    CorrectorFailed,
}

/// Result of [`CorrectionLoop::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionOutcome {
    /// Design after the last accepted correction.
    pub final_design: String,
    /// Every iteration, in order.
    pub history: Vec<CorrectionIteration>,
    /// Issues still open. Never silently dropped.
    pub remaining_issues: Vec<ValidationIssue>,
    /// Why the loop stopped.
    pub stop_reason: StopReason,
    /// The corrector failure, when `stop_reason` is `CorrectorFailed`.
    pub error: Option<CollaboratorError>,
}

/// Drives a [`DesignCorrector`] against a [`DesignValidator`].
pub struct CorrectionLoop<'a> {
    validator: &'a DesignValidator,
    corrector: &'a dyn DesignCorrector,
    stagnation: StagnationPolicy,
}

impl<'a> CorrectionLoop<'a> {
    /// Creates a loop with [`StagnationPolicy::SetEquality`].
    pub fn new(validator: &'a DesignValidator, corrector: &'a dyn DesignCorrector) -> Self {
        Self {
            validator,
            corrector,
            stagnation: StagnationPolicy::default(),
        }
    }

    /// Overrides stagnation detection.
    ///
    /// Under the default [`StagnationPolicy::SetEquality`], a corrector that
    /// never resolves anything stops after two iterations with
    /// [`StopReason::Stagnated`], before a cap of three or more is reached.
    /// Use [`StagnationPolicy::Disabled`] to run such a corrector until
    /// `max_iterations`.
    #[must_use]
    pub fn with_stagnation(mut self, policy: StagnationPolicy) -> Self {
        self.stagnation = policy;
        self
    }

    /// Runs at most `max_iterations` correction iterations over `issues`.
    ///
    /// Issues detected by a validator rule are considered resolved when
    /// re-validation no longer reports their code. Other issues (review
    /// findings) are considered resolved when the corrector's change log
    /// names them.
    pub async fn run(
        &self,
        design: &str,
        issues: Vec<ValidationIssue>,
        profile: &ComplexityProfile,
        max_iterations: u32,
    ) -> CorrectionOutcome {
        let mut current = design.to_string();
        let mut remaining = issues;
        let mut history: Vec<CorrectionIteration> = Vec::new();

        if remaining.is_empty() {
            return outcome(current, history, remaining, StopReason::NothingToCorrect, None);
        }

        // Codes present on the design currently under correction.
        let mut baseline: BTreeSet<IssueCode> = self.validator.validate(&current, profile).codes();
        baseline.extend(remaining.iter().map(|i| i.code.clone()));

        for iteration_number in 1..=max_iterations {
            let request = CorrectionRequest {
                design: &current,
                issues: &remaining,
                profile,
                iteration: iteration_number,
            };
            let proposal = match self.corrector.correct(request).await {
                Ok(proposal) => proposal,
                Err(error) => {
                    warn!(
                        iteration = iteration_number,
                        error = %error,
                        "Design corrector failed; keeping last accepted design"
                    );
                    return outcome(
                        current,
                        history,
                        remaining,
                        StopReason::CorrectorFailed,
                        Some(error),
                    );
                }
            };

            let report = self.validator.validate(&proposal.corrected_design, profile);
            let new_codes: Vec<IssueCode> = report
                .codes()
                .into_iter()
                .filter(|c| !baseline.contains(c))
                .collect();

            let addressed = remaining.clone();
            let corrected_design = if new_codes.is_empty() {
                let fixed: BTreeSet<&IssueCode> =
                    proposal.changes.iter().map(|c| &c.issue_code).collect();
                remaining = addressed
                    .iter()
                    .filter_map(|issue| {
                        if self.validator.detects(&issue.code) {
                            report.issues.iter().find(|i| i.code == issue.code).cloned()
                        } else if fixed.contains(&issue.code) {
                            None
                        } else {
                            Some(issue.clone())
                        }
                    })
                    .collect();
                baseline = report.codes();
                baseline.extend(remaining.iter().map(|i| i.code.clone()));
                proposal.corrected_design
            } else {
                warn!(
                    iteration = iteration_number,
                    new_codes = ?new_codes,
                    "Rejected correction that introduced new issues"
                );
                current.clone()
            };

            debug!(
                iteration = iteration_number,
                addressed = addressed.len(),
                remaining = remaining.len(),
                "Correction iteration finished"
            );

            let input_design = std::mem::replace(&mut current, corrected_design);
            history.push(CorrectionIteration {
                iteration_number,
                input_design,
                issues_addressed: addressed,
                corrected_design: current.clone(),
                changes_made: proposal.changes,
                remaining_issues: remaining.clone(),
                confidence: proposal.confidence,
                rejected_codes: new_codes,
            });

            if remaining.is_empty() {
                info!(iterations = iteration_number, "Correction loop converged");
                return outcome(current, history, remaining, StopReason::Converged, None);
            }
            if iteration_number == max_iterations {
                break;
            }
            if self.is_stagnant(&history) {
                warn!(
                    iterations = iteration_number,
                    remaining = remaining.len(),
                    "Correction loop stagnated"
                );
                return outcome(current, history, remaining, StopReason::Stagnated, None);
            }
        }

        warn!(
            max_iterations,
            remaining = remaining.len(),
            "Correction loop reached its iteration cap"
        );
        outcome(current, history, remaining, StopReason::IterationCap, None)
    }

    fn is_stagnant(&self, history: &[CorrectionIteration]) -> bool {
        if self.stagnation == StagnationPolicy::Disabled {
            return false;
        }
        let [.., previous, last] = history else {
            return false;
        };
        codes_of(&previous.remaining_issues) == codes_of(&last.remaining_issues)
    }
}

fn codes_of(issues: &[ValidationIssue]) -> BTreeSet<&IssueCode> {
    issues.iter().map(|i| &i.code).collect()
}

fn outcome(
    final_design: String,
    history: Vec<CorrectionIteration>,
    remaining_issues: Vec<ValidationIssue>,
    stop_reason: StopReason,
    error: Option<CollaboratorError>,
) -> CorrectionOutcome {
    CorrectionOutcome {
        final_design,
        history,
        remaining_issues,
        stop_reason,
        error,
    }
}
