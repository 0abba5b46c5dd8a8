//! Semantic sanity review port.
//!
//! The review is an LLM-backed judgement the core treats as a black box. Its
//! hallucination findings are folded into the validation report so the
//! correction loop can address them alongside rule-based issues.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    CheckStatus, CollaboratorError, ComplexityProfile, Confidence, IssueCode, Severity,
    ValidationIssue, ValidationReport,
};

/// Name of the check recorded for the sanity review.
pub const SANITY_REVIEW_CHECK: &str = "sanity_review";

/// Overall verdict of a sanity review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallAssessment {
    /// No concerns.
    Sound,
    /// Usable, with concerns worth recording.
    SoundWithConcerns,
    /// The design has substantive problems.
    Problematic,
}

/// A claim in the design that the reviewer believes is fabricated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HallucinationFinding {
    /// The suspicious claim as written.
    pub claim: String,
    /// Why the reviewer doubts it.
    pub reason: String,
}

/// Result of one sanity review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanityReviewResult {
    /// Reviewer confidence.
    pub confidence: Confidence,
    /// Overall verdict.
    pub overall_assessment: OverallAssessment,
    /// Suspected fabrications.
    #[serde(default)]
    pub hallucinations: Vec<HallucinationFinding>,
    /// Risks to carry into the handoff.
    #[serde(default)]
    pub risks: Vec<String>,
}

impl SanityReviewResult {
    /// Converts hallucination findings into `review.hallucination.<slug>` warnings.
    pub fn issues(&self) -> Vec<ValidationIssue> {
        self.hallucinations
            .iter()
            .map(|h| {
                ValidationIssue::new(
                    IssueCode::qualified("review.hallucination", &h.claim),
                    Severity::Warning,
                    format!("Possibly fabricated claim '{}': {}", h.claim, h.reason),
                )
                .correctable()
                .with_suggestion("Remove the claim or replace it with a verifiable one")
            })
            .collect()
    }
}

impl ValidationReport {
    /// Returns a new report with the review's findings appended.
    pub fn with_review(&self, review: &SanityReviewResult) -> ValidationReport {
        let mut checks = self.checks.clone();
        let extra = review.issues();
        let status = if extra.is_empty() && review.overall_assessment != OverallAssessment::Problematic {
            CheckStatus::Pass
        } else {
            CheckStatus::Fail
        };
        checks.insert(SANITY_REVIEW_CHECK.to_string(), status);
        let mut issues = self.issues.clone();
        issues.extend(extra);
        ValidationReport::from_parts(checks, issues)
    }
}

/// Performs a semantic review of a design.
#[async_trait]
pub trait SanityReviewer: Send + Sync {
    /// Reviews `design` given the rule-based report and the complexity profile.
    async fn review(
        &self,
        design: &str,
        report: &ValidationReport,
        profile: &ComplexityProfile,
    ) -> Result<SanityReviewResult, CollaboratorError>;
}

/// Reviewer that always reports a sound design. Used when semantic review is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReviewer;

#[async_trait]
impl SanityReviewer for NoopReviewer {
    async fn review(
        &self,
        _design: &str,
        _report: &ValidationReport,
        _profile: &ComplexityProfile,
    ) -> Result<SanityReviewResult, CollaboratorError> {
        Ok(SanityReviewResult {
            confidence: Confidence::certain(),
            overall_assessment: OverallAssessment::Sound,
            hallucinations: Vec::new(),
            risks: Vec::new(),
        })
    }
}
