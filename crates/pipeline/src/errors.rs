//! Top-level error and retry-disposition types for the Planforge pipeline domain.
//!
//! [`PlanforgeError`] covers conditions surfaced at the orchestrator boundary.
//! Component-level errors (LLM call failures, checkpoint I/O failures) are
//! defined in their respective modules and convert into it.
//!
//! [`Retryability`] is a cross-cutting concern: any error type that participates
//! in retry decisions implements [`Classify`] to produce one.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::RunId;

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// Returned by infrastructure error types to let the retry policy decide
/// whether to re-invoke an operation or surface the failure.
///
/// - `Retryable` errors: network failures, timeouts, 5xx and 429 responses.
/// - `NonRetryable` errors: invalid credentials, invalid requests, bad
///   configuration, cancellation, exhausted rate-limit waits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Retryability {
    /// The operation may be retried.
    ///
    /// `after` optionally specifies the delay before retrying (derived from a
    /// provider `Retry-After`); when present it overrides computed back-off.
    Retryable {
        /// Provider-mandated delay. `None` means apply the caller's own
        /// back-off schedule.
        after: Option<Duration>,
    },
    /// The operation must not be retried.
    NonRetryable,
}

impl Retryability {
    /// Returns `true` for [`Retryability::Retryable`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

/// Classifies an error for retry decisions.
pub trait Classify {
    /// Returns whether (and after what delay) the failed operation may be retried.
    fn retryability(&self) -> Retryability;
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Serialisable discriminant of the error taxonomy.
///
/// Stored on failed stage results so the terminal state of a run can be
/// explained without carrying the original error value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network, 5xx or 429 failures that survived every retry.
    Transient,
    /// The rate limiter's wait ceiling was hit.
    RateLimitExceeded,
    /// The design could not be fully repaired; recorded, never fatal.
    ValidationFailure,
    /// A checkpoint could not be decoded.
    CheckpointCorrupted,
    /// Bad configuration, invalid credentials, or programmer error.
    Fatal,
    /// The run was cancelled by the user.
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::ValidationFailure => "validation_failure",
            Self::CheckpointCorrupted => "checkpoint_corrupted",
            Self::Fatal => "fatal",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by the pipeline core.
///
/// Stage-level failures are caught at the orchestrator boundary and turned
/// into a failed [`crate::StageResult`]; this type is what the boundary and the
/// public entry points (`resume`, configuration loading) report.
#[derive(Debug, Error)]
pub enum PlanforgeError {
    /// The design still fails validation after correction, or could not be
    /// corrected. Recorded on the stage result and as known risks; the run
    /// continues.
    #[error("Design has {unresolved} unresolved validation issue(s)")]
    ValidationFailure {
        /// Number of issues left unresolved.
        unresolved: usize,
    },

    /// A checkpoint record exists but cannot be decoded.
    ///
    /// Fatal only to resuming from that specific record.
    #[error("Checkpoint {sequence} for run {run_id} is corrupted: {reason}")]
    CheckpointCorrupted {
        /// Run the record belongs to.
        run_id: RunId,
        /// Sequence number of the unreadable record.
        sequence: u32,
        /// Why decoding failed.
        reason: String,
    },

    /// No checkpoint exists for the run.
    #[error("No checkpoint found for run {run_id}")]
    CheckpointNotFound {
        /// Run that was looked up.
        run_id: RunId,
    },

    /// Checkpoint storage failed for reasons other than corruption.
    #[error("Checkpoint storage error: {message}")]
    CheckpointStorage {
        /// Description of the storage failure.
        message: String,
    },

    /// The pipeline configuration is invalid.
    ///
    /// Produced at load time; the pipeline never starts with an invalid config.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A credential is missing or was rejected by the provider.
    #[error("Credential error: {message}")]
    Credentials {
        /// Description of the credential problem.
        message: String,
    },
}

impl PlanforgeError {
    /// Creates a [`PlanforgeError::Configuration`] from any message.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Returns the taxonomy bucket this error falls into.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ValidationFailure { .. } => ErrorKind::ValidationFailure,
            Self::CheckpointCorrupted { .. } => ErrorKind::CheckpointCorrupted,
            Self::CheckpointNotFound { .. }
            | Self::CheckpointStorage { .. }
            | Self::Configuration { .. }
            | Self::Credentials { .. } => ErrorKind::Fatal,
        }
    }
}

// ---------------------------------------------------------------------------
// Collaborator errors
// ---------------------------------------------------------------------------

/// Failure reported by an external collaborator (complexity estimator, sanity
/// reviewer, design corrector).
///
/// LLM-backed collaborators translate their gateway failures into
/// [`CollaboratorError::Call`] so the orchestrator can keep the retry count and
/// any partial output on the failed stage result.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollaboratorError {
    /// The underlying call failed after the retry policy gave up, or was cancelled.
    #[error("{kind} failure after {attempts} attempt(s): {message}")]
    Call {
        /// Taxonomy bucket of the failure.
        kind: ErrorKind,
        /// Description of the failure.
        message: String,
        /// Attempts made (at least 1 when a call was issued).
        attempts: u32,
        /// Output received before the failure.
        partial_output: String,
    },

    /// The collaborator answered, but the answer could not be used.
    #[error("Invalid collaborator response: {message}")]
    InvalidResponse {
        /// Why the response was rejected.
        message: String,
    },
}

impl CollaboratorError {
    /// Creates an [`CollaboratorError::InvalidResponse`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            message: message.into(),
        }
    }

    /// Returns the taxonomy bucket of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Call { kind, .. } => *kind,
            Self::InvalidResponse { .. } => ErrorKind::Fatal,
        }
    }

    /// Attempts made before giving up (`0` when no call was issued).
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Call { attempts, .. } => *attempts,
            Self::InvalidResponse { .. } => 0,
        }
    }

    /// Output received before the failure, if any.
    pub fn partial_output(&self) -> &str {
        match self {
            Self::Call { partial_output, .. } => partial_output,
            Self::InvalidResponse { .. } => "",
        }
    }
}
