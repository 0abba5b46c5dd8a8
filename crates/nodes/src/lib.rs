//! Planforge stage execution, LLM gateway, and pipeline orchestrator.
//!
//! This crate turns the domain types of [`pipeline`] into a running pipeline:
//! the [`LlmGateway`] every stage calls through, the LLM-backed collaborator
//! implementations, concurrent phase expansion, and the
//! [`PipelineOrchestrator`] state machine that checkpoints after every stage.
//!
//! ## Architectural Layer
//!
//! **Orchestration layer.** Nodes sequence calls between business logic in the
//! [`pipeline`] crate and infrastructure (LLM clients from [`llm`], checkpoint
//! stores behind [`pipeline::CheckpointStore`]). They contain no validation or
//! correction rules of their own.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`gateway`] | [`LlmGateway`]: cancellation, concurrency, rate limiting, retry |
//! | [`collaborators`] | LLM-backed estimator, reviewer and corrector |
//! | [`phases`] | Concurrent per-phase expansion |
//! | [`prompts`] | Prompt text and template variant selection |
//! | [`orchestrator`] | [`PipelineOrchestrator`] and its builder |

pub mod collaborators;
pub mod gateway;
pub mod orchestrator;
pub mod phases;
pub mod prompts;

pub use collaborators::{LlmComplexityEstimator, LlmDesignCorrector, LlmSanityReviewer};
pub use gateway::{Completion, GatewayError, LlmGateway};
pub use orchestrator::{known_risks_section, OrchestratorBuilder, PipelineOrchestrator};
pub use phases::{expand_phases, render_phases, PhaseExpansion};
