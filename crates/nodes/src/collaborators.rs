//! LLM-backed implementations of the collaborator ports.
//!
//! | Port | Implementation | Unusable output |
//! |------|----------------|-----------------|
//! | [`ComplexityEstimator`] | [`LlmComplexityEstimator`] | heuristic fallback, confidence halved |
//! | [`SanityReviewer`] | [`LlmSanityReviewer`] | review skipped |
//! | [`DesignCorrector`] | [`LlmDesignCorrector`] | empty change log |
//!
//! Gateway failures always propagate as [`CollaboratorError::Call`] so the
//! orchestrator can record attempts and partial output.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use pipeline::{
    ChangeRecord, CollaboratorError, ComplexityEstimator, ComplexityProfile, Confidence,
    CorrectionProposal, CorrectionRequest, DepthLevel, DesignCorrector,
    HeuristicComplexityEstimator, OverallAssessment, SanityReviewResult, SanityReviewer, Stage,
    ValidationReport,
};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::gateway::LlmGateway;
use crate::prompts;

/// Confidence assumed for a correction whose change log does not state one.
const DEFAULT_CORRECTION_CONFIDENCE: f64 = 0.7;

/// Returns the JSON document embedded in an LLM reply.
///
/// Prefers the last fenced ```json block; otherwise takes the span from the
/// first opening brace or bracket to the matching last closing one.
pub(crate) fn extract_json(text: &str) -> Option<&str> {
    if let Some((_, block)) = fenced_json(text) {
        return Some(block);
    }
    let start = text.find(['{', '['])?;
    let close = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

/// Splits out the last fenced ```json block: `(text before the fence, block body)`.
fn fenced_json(text: &str) -> Option<(&str, &str)> {
    let open = text.rfind("```json")?;
    let body_start = open + "```json".len();
    let body_len = text[body_start..].find("```")?;
    Some((&text[..open], text[body_start..body_start + body_len].trim()))
}

// ---------------------------------------------------------------------------
// Complexity
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ProfileReply {
    score: f64,
    #[serde(default)]
    estimated_phase_count: Option<u32>,
    #[serde(default)]
    depth_level: Option<DepthLevel>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    complexity_factors: BTreeMap<String, String>,
    #[serde(default)]
    follow_up_questions: Vec<String>,
    #[serde(default)]
    hidden_risks: Vec<String>,
}

impl ProfileReply {
    fn into_profile(self) -> Result<ComplexityProfile, String> {
        let (depth, phases) = ComplexityProfile::banding(self.score);
        let confidence = match self.confidence {
            Some(value) => Confidence::new(value).ok_or_else(|| format!("confidence {value} is outside [0, 1]"))?,
            None => Confidence::saturating(0.5),
        };
        let mut profile = ComplexityProfile::new(
            self.score,
            self.estimated_phase_count.unwrap_or(phases),
            self.depth_level.unwrap_or(depth),
            confidence,
            self.rationale,
        )
        .map_err(|e| e.to_string())?;
        profile.complexity_factors = self.complexity_factors;
        profile.follow_up_questions = self.follow_up_questions;
        profile.hidden_risks = self.hidden_risks;
        Ok(profile)
    }
}

fn parse_profile(text: &str) -> Result<ComplexityProfile, String> {
    let json = extract_json(text).ok_or("no JSON object in reply")?;
    serde_json::from_str::<ProfileReply>(json)
        .map_err(|e| e.to_string())?
        .into_profile()
}

/// Estimates complexity with the complexity-stage client.
#[derive(Debug)]
pub struct LlmComplexityEstimator {
    gateway: Arc<LlmGateway>,
    fallback: HeuristicComplexityEstimator,
}

impl LlmComplexityEstimator {
    /// Wraps `gateway`, falling back to the default heuristic.
    pub fn new(gateway: Arc<LlmGateway>) -> Self {
        Self {
            gateway,
            fallback: HeuristicComplexityEstimator::new(),
        }
    }
}

#[async_trait]
impl ComplexityEstimator for LlmComplexityEstimator {
    async fn estimate(&self, interview: &str) -> Result<ComplexityProfile, CollaboratorError> {
        // No profile exists yet, so the request uses the standard variant.
        let template = prompts::template_for(Stage::Complexity, DepthLevel::Standard);
        let completion = self
            .gateway
            .complete(&template, &prompts::complexity(interview))
            .await?;
        match parse_profile(&completion.text) {
            Ok(profile) => Ok(profile),
            Err(reason) => {
                warn!(reason = %reason, "Unusable complexity reply; using heuristic estimate");
                let mut profile = self.fallback.profile(interview);
                profile.confidence = Confidence::saturating(profile.confidence.as_f64() / 2.0);
                Ok(profile)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sanity review
// ---------------------------------------------------------------------------

/// Semantic review with the validate-stage client.
#[derive(Debug)]
pub struct LlmSanityReviewer {
    gateway: Arc<LlmGateway>,
}

impl LlmSanityReviewer {
    /// Wraps `gateway`.
    pub fn new(gateway: Arc<LlmGateway>) -> Self {
        Self { gateway }
    }
}

fn skipped_review() -> SanityReviewResult {
    SanityReviewResult {
        confidence: Confidence::saturating(0.0),
        overall_assessment: OverallAssessment::Sound,
        hallucinations: Vec::new(),
        risks: Vec::new(),
    }
}

#[async_trait]
impl SanityReviewer for LlmSanityReviewer {
    async fn review(
        &self,
        design: &str,
        report: &ValidationReport,
        profile: &ComplexityProfile,
    ) -> Result<SanityReviewResult, CollaboratorError> {
        let template = prompts::template_for(Stage::Validate, profile.depth_level);
        let completion = self
            .gateway
            .complete(&template, &prompts::review(design, report, profile))
            .await?;
        let parsed = extract_json(&completion.text)
            .ok_or_else(|| "no JSON object in reply".to_string())
            .and_then(|json| serde_json::from_str::<SanityReviewResult>(json).map_err(|e| e.to_string()));
        match parsed {
            Ok(review) => {
                debug!(
                    hallucinations = review.hallucinations.len(),
                    risks = review.risks.len(),
                    "Sanity review parsed"
                );
                Ok(review)
            }
            Err(reason) => {
                warn!(reason = %reason, "Unusable sanity review; skipping review");
                Ok(skipped_review())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Correction
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChangeLog {
    Bare(Vec<ChangeRecord>),
    Annotated {
        changes: Vec<ChangeRecord>,
        #[serde(default)]
        confidence: Option<f64>,
    },
}

/// Splits a corrector reply into the design and its change log.
fn parse_correction(text: &str) -> CorrectionProposal {
    let Some((design, block)) = fenced_json(text) else {
        warn!("Correction reply has no change log");
        return CorrectionProposal {
            corrected_design: text.trim().to_string(),
            changes: Vec::new(),
            confidence: Confidence::saturating(DEFAULT_CORRECTION_CONFIDENCE),
        };
    };
    let (changes, confidence) = match serde_json::from_str::<ChangeLog>(block) {
        Ok(ChangeLog::Bare(changes)) => (changes, None),
        Ok(ChangeLog::Annotated { changes, confidence }) => (changes, confidence),
        Err(e) => {
            warn!(error = %e, "Unparsable correction change log");
            (Vec::new(), None)
        }
    };
    CorrectionProposal {
        corrected_design: design.trim_end().to_string(),
        changes,
        confidence: Confidence::saturating(confidence.unwrap_or(DEFAULT_CORRECTION_CONFIDENCE)),
    }
}

/// Rewrites designs with the correct-stage client.
#[derive(Debug)]
pub struct LlmDesignCorrector {
    gateway: Arc<LlmGateway>,
}

impl LlmDesignCorrector {
    /// Wraps `gateway`.
    pub fn new(gateway: Arc<LlmGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl DesignCorrector for LlmDesignCorrector {
    async fn correct(
        &self,
        request: CorrectionRequest<'_>,
    ) -> Result<CorrectionProposal, CollaboratorError> {
        let template = prompts::template_for(Stage::Correct, request.profile.depth_level);
        let completion = self
            .gateway
            .complete(&template, &prompts::correction(&request))
            .await?;
        let proposal = parse_correction(&completion.text);
        if proposal.corrected_design.is_empty() {
            return Err(CollaboratorError::invalid("corrector returned an empty design"));
        }
        Ok(proposal)
    }
}
