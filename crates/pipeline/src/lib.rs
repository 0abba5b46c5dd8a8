//! Core domain for Planforge.
//!
//! This crate contains every domain concept, newtype identifier, shared value
//! type, and cross-cutting error type used by the pipeline. Infrastructure
//! crates implement the traits defined here; they never add domain rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no I/O dependencies.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`RunId`, `IssueCode`, `TemplateId`) |
//! | [`types`] | Shared value types (`TokenCount`, `Confidence`, `Severity`, `Timestamp`) |
//! | [`errors`] | Run-level error taxonomy and retry classification |
//! | [`stage`] | Stages, stage results, and the run record |
//! | [`complexity`] | `ComplexityProfile`, the estimator port, the heuristic estimator |
//! | [`llm`] | The `LlmClient` port and its request, response and error types |
//! | [`validation`] | `DesignValidator` and its configurable rules |
//! | [`review`] | The `SanityReviewer` port |
//! | [`correction`] | The `DesignCorrector` port and `CorrectionLoop` |
//! | [`checkpoint`] | The `CheckpointStore` port and `RunSnapshot` |
//! | [`config`] | `PipelineConfig` and per-stage client resolution |

pub mod checkpoint;
pub mod complexity;
pub mod config;
pub mod correction;
pub mod errors;
pub mod identifiers;
pub mod llm;
pub mod review;
pub mod stage;
pub mod types;
pub mod validation;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use checkpoint::{
    entries_to_delete, CheckpointEntry, CheckpointError, CheckpointRecord, CheckpointStore,
    CleanupPolicy, RunSnapshot,
};
pub use complexity::{
    ComplexityError, ComplexityEstimator, ComplexityFactor, ComplexityProfile, DepthLevel,
    HeuristicComplexityEstimator,
};
pub use config::{
    CheckpointSettings, ClientSettings, CommandSettings, PipelineConfig, RateLimitSettings,
    ResolvedClient, RetrySettings, StageOverride,
};
pub use correction::{
    ChangeRecord, CorrectionIteration, CorrectionLoop, CorrectionOutcome, CorrectionProposal,
    CorrectionRequest, DesignCorrector, StagnationPolicy, StopReason,
};
pub use errors::{Classify, CollaboratorError, ErrorKind, PlanforgeError, Retryability};
pub use identifiers::{slug, IssueCode, RunId, TemplateId};
pub use llm::{
    LlmClient, LlmError, LlmRequest, LlmResponse, LlmStream, ProviderKind, RateLimitHeaders,
    ResponseMetadata, StreamEvent, TokenUsage,
};
pub use review::{
    HallucinationFinding, NoopReviewer, OverallAssessment, SanityReviewResult, SanityReviewer,
    SANITY_REVIEW_CHECK,
};
pub use stage::{
    KnownRisk, PipelineRun, RiskSource, RunStatus, Stage, StageError, StageResult,
    StructuredOutput,
};
pub use types::{Confidence, Severity, Timestamp, TokenCount};
pub use validation::{
    CheckStatus, DatabaseName, DesignValidator, DisallowedTerm, ScopeRanges, SectionRequirement,
    TermCategory, ValidationIssue, ValidationReport, ValidationRule, ValidatorConfig,
    ValidatorConfigError, WordRange,
};
