//! The checkpoint store port and the resumable run snapshot.
//!
//! A checkpoint is written after every committed stage and never modified
//! afterwards. Resuming reads only the newest readable record for a run.
//!
//! # Single-writer assumption
//!
//! Stores must tolerate concurrent writers for *different* runs. A single run
//! is only ever advanced by one orchestrator at a time; stores are not
//! required to arbitrate between two writers of the same run and may report
//! [`CheckpointError::AlreadyExists`] if that assumption is violated.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    ComplexityProfile, CorrectionIteration, KnownRisk, PlanforgeError, RunId, SanityReviewResult,
    Stage, StageResult, Timestamp, ValidationReport,
};

/// Everything needed to resume a run at its next stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    /// Requirements interview text.
    pub interview: String,
    /// Complexity profile, once estimated.
    pub profile: Option<ComplexityProfile>,
    /// Current design (after any accepted corrections).
    pub design: Option<String>,
    /// Latest validation report.
    pub validation: Option<ValidationReport>,
    /// Latest sanity review.
    pub review: Option<SanityReviewResult>,
    /// Correction history.
    #[serde(default)]
    pub corrections: Vec<CorrectionIteration>,
    /// Risks accumulated so far.
    #[serde(default)]
    pub known_risks: Vec<KnownRisk>,
    /// Development plan.
    pub devplan: Option<String>,
    /// Expanded phase documents by phase number.
    #[serde(default)]
    pub phases: BTreeMap<u32, String>,
    /// Handoff document.
    pub handoff: Option<String>,
    /// Stages committed so far, in order.
    #[serde(default)]
    pub completed: Vec<Stage>,
    /// Stage to execute on resume; `None` once the run is complete.
    pub next_stage: Option<Stage>,
    /// Result of the stage this snapshot commits.
    pub last_result: Option<StageResult>,
}

impl RunSnapshot {
    /// Starts a snapshot for a fresh run.
    pub fn new(interview: impl Into<String>) -> Self {
        Self {
            interview: interview.into(),
            next_stage: Some(Stage::Interview),
            ..Self::default()
        }
    }

    /// Returns `true` if `stage` has been committed.
    pub fn has_completed(&self, stage: Stage) -> bool {
        self.completed.contains(&stage)
    }

    /// The furthest committed stage.
    pub fn furthest_stage(&self) -> Option<Stage> {
        self.completed.iter().copied().max_by_key(|s| s.ordinal())
    }
}

/// A persisted checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Run the record belongs to.
    pub run_id: RunId,
    /// Stage the record commits.
    pub stage: Stage,
    /// Position in the run's checkpoint sequence (1-based).
    pub sequence: u32,
    /// When the record was written.
    pub created_at: Timestamp,
    /// Resumable state.
    pub state: RunSnapshot,
}

/// Metadata of a persisted checkpoint, available without decoding its state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    /// Run the record belongs to.
    pub run_id: RunId,
    /// Stage the record commits.
    pub stage: Stage,
    /// Position in the run's checkpoint sequence.
    pub sequence: u32,
    /// When the record was written.
    pub created_at: Timestamp,
}

/// Which checkpoints [`CheckpointStore::delete`] removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupPolicy {
    /// Every checkpoint of the run.
    All,
    /// Checkpoints older than the given age.
    OlderThan(Duration),
    /// All but the newest `n` checkpoints.
    KeepLatest(usize),
}

/// Checkpoint store failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CheckpointError {
    /// The run has no checkpoints.
    #[error("no checkpoint for run {run_id}")]
    NotFound {
        /// Run looked up.
        run_id: RunId,
    },

    /// A record exists but cannot be decoded.
    #[error("checkpoint {sequence} of run {run_id} is corrupted: {reason}")]
    Corrupted {
        /// Run the record belongs to.
        run_id: RunId,
        /// Sequence of the unreadable record.
        sequence: u32,
        /// Why decoding failed.
        reason: String,
    },

    /// A record with the same sequence already exists (write-once violation).
    #[error("checkpoint {sequence} of run {run_id} already exists")]
    AlreadyExists {
        /// Run the record belongs to.
        run_id: RunId,
        /// Conflicting sequence.
        sequence: u32,
    },

    /// Underlying storage failed.
    #[error("checkpoint storage failure: {0}")]
    Storage(String),
}

impl From<CheckpointError> for PlanforgeError {
    fn from(error: CheckpointError) -> Self {
        match error {
            CheckpointError::NotFound { run_id } => PlanforgeError::CheckpointNotFound { run_id },
            CheckpointError::Corrupted {
                run_id,
                sequence,
                reason,
            } => PlanforgeError::CheckpointCorrupted {
                run_id,
                sequence,
                reason,
            },
            other => PlanforgeError::CheckpointStorage {
                message: other.to_string(),
            },
        }
    }
}

/// Durable, append-only storage for run checkpoints.
///
/// See the module documentation for the single-writer assumption.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Appends a checkpoint committing `stage` and returns the stored record.
    ///
    /// Readers never observe a partially written record.
    async fn save(
        &self,
        run_id: RunId,
        stage: Stage,
        state: &RunSnapshot,
    ) -> Result<CheckpointRecord, CheckpointError>;

    /// Loads the newest checkpoint of `run_id`.
    ///
    /// Fails with [`CheckpointError::Corrupted`] when that record is unreadable.
    async fn load_latest(&self, run_id: RunId) -> Result<CheckpointRecord, CheckpointError>;

    /// Loads a specific checkpoint.
    async fn load(&self, run_id: RunId, sequence: u32) -> Result<CheckpointRecord, CheckpointError>;

    /// Lists the run's checkpoints in sequence order without decoding them.
    async fn list(&self, run_id: RunId) -> Result<Vec<CheckpointEntry>, CheckpointError>;

    /// Removes checkpoints matching `policy` and returns how many were removed.
    async fn delete(&self, run_id: RunId, policy: CleanupPolicy) -> Result<usize, CheckpointError>;
}

/// Selects the entries `policy` removes. `entries` must be in sequence order.
pub fn entries_to_delete(entries: &[CheckpointEntry], policy: CleanupPolicy) -> Vec<CheckpointEntry> {
    match policy {
        CleanupPolicy::All => entries.to_vec(),
        CleanupPolicy::OlderThan(age) => entries
            .iter()
            .filter(|e| e.created_at.age() > age)
            .cloned()
            .collect(),
        CleanupPolicy::KeepLatest(keep) => {
            let cut = entries.len().saturating_sub(keep);
            entries[..cut].to_vec()
        }
    }
}
