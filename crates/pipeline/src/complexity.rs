//! Complexity estimation: the profile that drives every downstream stage.
//!
//! A [`ComplexityProfile`] is produced once per run by the complexity stage and
//! is immutable thereafter. Its `depth_level` selects template variants and its
//! `estimated_phase_count` sizes the development plan.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{CollaboratorError, Confidence};

/// Lowest permitted complexity score.
pub const MIN_SCORE: f64 = 0.0;
/// Highest permitted complexity score.
pub const MAX_SCORE: f64 = 20.0;
/// Smallest permitted phase count.
pub const MIN_PHASES: u32 = 3;
/// Largest permitted phase count.
pub const MAX_PHASES: u32 = 15;

// ---------------------------------------------------------------------------
// Depth
// ---------------------------------------------------------------------------

/// How much detail downstream documents carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthLevel {
    /// Small projects: short documents, few phases.
    Minimal,
    /// The common case.
    Standard,
    /// Large projects: exhaustive documents.
    Detailed,
}

impl DepthLevel {
    /// Returns the canonical snake_case name (also the template variant suffix).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Standard => "standard",
            Self::Detailed => "detailed",
        }
    }
}

impl std::fmt::Display for DepthLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

/// Range violations detected when accepting a profile from a collaborator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ComplexityError {
    /// Score outside `[0, 20]` or not finite.
    #[error("complexity score {0} is outside [0, 20]")]
    ScoreOutOfRange(f64),
    /// Phase count outside `[3, 15]`.
    #[error("phase count {0} is outside [3, 15]")]
    PhaseCountOutOfRange(u32),
}

/// Structured estimate of project scope and difficulty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityProfile {
    /// Overall score in `[0, 20]`.
    pub score: f64,
    /// Number of development phases to plan, in `[3, 15]`.
    pub estimated_phase_count: u32,
    /// Detail level for downstream documents.
    pub depth_level: DepthLevel,
    /// Estimator confidence.
    pub confidence: Confidence,
    /// Free-text justification.
    pub rationale: String,
    /// Factor name to free-text severity (e.g. `"payments" → "high"`).
    #[serde(default)]
    pub complexity_factors: BTreeMap<String, String>,
    /// Questions worth asking the stakeholder before committing to the plan.
    #[serde(default)]
    pub follow_up_questions: Vec<String>,
    /// Risks the requirements imply but do not state.
    #[serde(default)]
    pub hidden_risks: Vec<String>,
}

impl ComplexityProfile {
    /// Maps a score to its depth level and phase count.
    ///
    /// `≤3` → minimal/3, `≤7` → standard/5, `≤12` → standard/7, otherwise
    /// detailed with 9 phases plus one per two points above 12, capped at 15.
    pub fn banding(score: f64) -> (DepthLevel, u32) {
        let score = clamp_score(score);
        if score <= 3.0 {
            (DepthLevel::Minimal, 3)
        } else if score <= 7.0 {
            (DepthLevel::Standard, 5)
        } else if score <= 12.0 {
            (DepthLevel::Standard, 7)
        } else {
            let extra = ((score - 12.0) / 2.0).floor() as u32;
            (DepthLevel::Detailed, (9 + extra).min(MAX_PHASES))
        }
    }

    /// Creates a profile, rejecting an out-of-range score or phase count.
    pub fn new(
        score: f64,
        estimated_phase_count: u32,
        depth_level: DepthLevel,
        confidence: Confidence,
        rationale: impl Into<String>,
    ) -> Result<Self, ComplexityError> {
        Self {
            score,
            estimated_phase_count,
            depth_level,
            confidence,
            rationale: rationale.into(),
            complexity_factors: BTreeMap::new(),
            follow_up_questions: Vec::new(),
            hidden_risks: Vec::new(),
        }
        .checked()
    }

    /// Builds a profile whose depth and phase count follow [`Self::banding`].
    pub fn from_score(score: f64, confidence: Confidence, rationale: impl Into<String>) -> Self {
        let score = clamp_score(score);
        let (depth_level, estimated_phase_count) = Self::banding(score);
        Self {
            score,
            estimated_phase_count,
            depth_level,
            confidence,
            rationale: rationale.into(),
            complexity_factors: BTreeMap::new(),
            follow_up_questions: Vec::new(),
            hidden_risks: Vec::new(),
        }
    }

    /// Checks the range invariants of a profile received from a collaborator.
    pub fn checked(self) -> Result<Self, ComplexityError> {
        if !self.score.is_finite() || !(MIN_SCORE..=MAX_SCORE).contains(&self.score) {
            return Err(ComplexityError::ScoreOutOfRange(self.score));
        }
        if !(MIN_PHASES..=MAX_PHASES).contains(&self.estimated_phase_count) {
            return Err(ComplexityError::PhaseCountOutOfRange(
                self.estimated_phase_count,
            ));
        }
        Ok(self)
    }
}

fn clamp_score(score: f64) -> f64 {
    if score.is_finite() {
        score.clamp(MIN_SCORE, MAX_SCORE)
    } else {
        MIN_SCORE
    }
}

// ---------------------------------------------------------------------------
// Estimator port
// ---------------------------------------------------------------------------

/// Produces the [`ComplexityProfile`] for a run from the interview text.
#[async_trait]
pub trait ComplexityEstimator: Send + Sync {
    /// Estimates complexity for the given requirements interview.
    async fn estimate(&self, interview: &str) -> Result<ComplexityProfile, CollaboratorError>;
}

// ---------------------------------------------------------------------------
// Heuristic estimator
// ---------------------------------------------------------------------------

/// A weighted keyword group contributing to the heuristic score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityFactor {
    /// Factor name reported in `complexity_factors`.
    pub name: String,
    /// Lowercase keywords; any match triggers the factor.
    pub keywords: Vec<String>,
    /// Score contribution when triggered.
    pub weight: f64,
    /// Hidden risk reported when the factor is triggered.
    pub risk: Option<String>,
    /// Follow-up question asked when the factor is *not* triggered.
    pub question: Option<String>,
}

impl ComplexityFactor {
    fn new(name: &str, keywords: &[&str], weight: f64) -> Self {
        Self {
            name: name.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            weight,
            risk: None,
            question: None,
        }
    }

    fn with_risk(mut self, risk: &str) -> Self {
        self.risk = Some(risk.to_string());
        self
    }

    fn with_question(mut self, question: &str) -> Self {
        self.question = Some(question.to_string());
        self
    }
}

/// Deterministic keyword-weighted estimator.
///
/// Used directly when no LLM estimator is configured and as the fallback when
/// an LLM estimate cannot be parsed.
#[derive(Debug, Clone)]
pub struct HeuristicComplexityEstimator {
    factors: Vec<ComplexityFactor>,
}

impl Default for HeuristicComplexityEstimator {
    fn default() -> Self {
        Self {
            factors: default_factors(),
        }
    }
}

impl HeuristicComplexityEstimator {
    /// Creates an estimator with the built-in factor table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the factor table.
    pub fn with_factors(factors: Vec<ComplexityFactor>) -> Self {
        Self { factors }
    }

    /// Computes the profile synchronously.
    pub fn profile(&self, interview: &str) -> ComplexityProfile {
        let text = format!(" {} ", interview.to_lowercase());
        let words = interview.split_whitespace().count();

        // Longer interviews describe more surface area; cap the contribution.
        let mut score = 1.0 + (words as f64 / 400.0).min(3.0);
        let mut factors = BTreeMap::new();
        let mut hidden_risks = Vec::new();
        let mut questions = Vec::new();

        for factor in &self.factors {
            let hits = factor
                .keywords
                .iter()
                .filter(|k| text.contains(k.as_str()))
                .count();
            if hits == 0 {
                if let Some(q) = &factor.question {
                    questions.push(q.clone());
                }
                continue;
            }
            score += factor.weight;
            let severity = if hits >= 2 { "high" } else { "medium" };
            factors.insert(factor.name.clone(), severity.to_string());
            if let Some(risk) = &factor.risk {
                hidden_risks.push(risk.clone());
            }
        }

        let confidence = Confidence::saturating(0.4 + 0.05 * (words as f64 / 100.0).min(6.0));
        let rationale = if factors.is_empty() {
            format!("{words} word interview with no notable complexity drivers")
        } else {
            let names: Vec<&str> = factors.keys().map(String::as_str).collect();
            format!(
                "{words} word interview; complexity drivers: {}",
                names.join(", ")
            )
        };

        let mut profile = ComplexityProfile::from_score(score, confidence, rationale);
        profile.complexity_factors = factors;
        profile.hidden_risks = hidden_risks;
        profile.follow_up_questions = questions;
        profile
    }
}

#[async_trait]
impl ComplexityEstimator for HeuristicComplexityEstimator {
    async fn estimate(&self, interview: &str) -> Result<ComplexityProfile, CollaboratorError> {
        Ok(self.profile(interview))
    }
}

fn default_factors() -> Vec<ComplexityFactor> {
    vec![
        ComplexityFactor::new(
            "integrations",
            &["integration", "third-party", "third party", "webhook", "external api"],
            2.0,
        )
        .with_risk("External services may change contracts or rate-limit the integration")
        .with_question("Which external systems must the project integrate with?"),
        ComplexityFactor::new(
            "authentication",
            &["login", "oauth", "sso", "authentication", "permission", "roles"],
            2.0,
        )
        .with_question("Do users need to sign in, and are there different roles?"),
        ComplexityFactor::new(
            "realtime",
            &["real-time", "realtime", "websocket", "live update", "streaming"],
            3.0,
        )
        .with_risk("Real-time delivery needs connection management and back-pressure"),
        ComplexityFactor::new(
            "data_scale",
            &["million", "high traffic", "at scale", "big data", "analytics"],
            3.0,
        )
        .with_risk("Data volume assumptions drive storage and indexing choices")
        .with_question("What data volume and traffic should the first release handle?"),
        ComplexityFactor::new(
            "multi_tenancy",
            &["multi-tenant", "multitenant", "tenant"],
            3.0,
        )
        .with_risk("Tenant isolation must be enforced in every query path"),
        ComplexityFactor::new(
            "payments",
            &["payment", "billing", "subscription", "checkout", "invoice"],
            3.0,
        )
        .with_risk("Payment flows carry PCI scope and reconciliation work"),
        ComplexityFactor::new(
            "machine_learning",
            &["machine learning", " ml ", "model training", "recommendation", " llm"],
            3.0,
        )
        .with_risk("Model quality is hard to guarantee and needs evaluation data"),
        ComplexityFactor::new(
            "compliance",
            &["hipaa", "gdpr", "pci", "soc 2", "compliance", "audit log"],
            3.0,
        )
        .with_risk("Regulatory requirements may constrain hosting and data retention"),
        ComplexityFactor::new(
            "platforms",
            &["mobile", "ios", "android", "desktop app"],
            2.0,
        )
        .with_question("Which platforms must be supported at launch?"),
        ComplexityFactor::new(
            "distributed",
            &["microservice", "distributed", "message queue", "event-driven", "kafka"],
            3.0,
        )
        .with_risk("Distributed components need failure handling between services"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banding_boundaries() {
        assert_eq!(ComplexityProfile::banding(0.0), (DepthLevel::Minimal, 3));
        assert_eq!(ComplexityProfile::banding(3.0), (DepthLevel::Minimal, 3));
        assert_eq!(ComplexityProfile::banding(5.5), (DepthLevel::Standard, 5));
        assert_eq!(ComplexityProfile::banding(12.0), (DepthLevel::Standard, 7));
        assert_eq!(ComplexityProfile::banding(14.0), (DepthLevel::Detailed, 10));
        assert_eq!(ComplexityProfile::banding(20.0), (DepthLevel::Detailed, 13));
        assert_eq!(ComplexityProfile::banding(99.0), (DepthLevel::Detailed, 13));
    }

    #[test]
    fn checked_rejects_out_of_range_values() {
        let mut profile = ComplexityProfile::from_score(5.0, Confidence::certain(), "ok");
        profile.estimated_phase_count = 2;
        assert_eq!(
            profile.clone().checked(),
            Err(ComplexityError::PhaseCountOutOfRange(2))
        );
        profile.estimated_phase_count = 5;
        profile.score = 25.0;
        assert_eq!(profile.checked(), Err(ComplexityError::ScoreOutOfRange(25.0)));
    }

    #[test]
    fn heuristic_scores_simple_project_as_minimal() {
        let profile = HeuristicComplexityEstimator::new()
            .profile("A personal todo list with a single page to add and tick off items.");
        assert_eq!(profile.depth_level, DepthLevel::Minimal);
        assert_eq!(profile.estimated_phase_count, 3);
        assert!(profile.complexity_factors.is_empty());
        assert!(!profile.follow_up_questions.is_empty());
    }

    #[test]
    fn heuristic_detects_drivers_and_risks() {
        let interview = "A multi-tenant SaaS with subscription billing, real-time dashboards \
                         over websocket, GDPR compliance and an event-driven Kafka backbone.";
        let profile = HeuristicComplexityEstimator::new().profile(interview);
        assert!(profile.score > 12.0);
        assert_eq!(profile.depth_level, DepthLevel::Detailed);
        assert_eq!(
            profile.complexity_factors.get("realtime").map(String::as_str),
            Some("high")
        );
        assert!(profile.complexity_factors.contains_key("payments"));
        assert!(profile
            .hidden_risks
            .iter()
            .any(|r| r.contains("Tenant isolation")));
    }

    #[tokio::test]
    async fn heuristic_estimator_implements_port() {
        let estimator: &dyn ComplexityEstimator = &HeuristicComplexityEstimator::new();
        let profile = estimator.estimate("Simple static site").await.unwrap();
        assert!(profile.clone().checked().is_ok());
    }
}
