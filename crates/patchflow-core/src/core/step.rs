// crates/patchflow-core/src/core/step.rs
// ============================================================================
// Module: Patchflow Step Model
// Description: Step documents, stage kinds, and the step transition table.
// Purpose: Capture one pipeline stage execution with dense ordinals.
// Dependencies: crate::core::{error, hashing, identifiers, time}, serde
// ============================================================================

//! ## Overview
//! A step is one stage execution within a run. Ordinals are dense and
//! strictly increasing; a step document is immutable once it reaches a
//! terminal status. Retryable failures re-enter `running` with an
//! incremented attempt counter rather than minting a new step.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::error::ErrorRecord;
use crate::core::hashing::HashDigest;
use crate::core::identifiers::RunId;
use crate::core::identifiers::StepId;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Stage Kind
// ============================================================================

/// Pipeline stage kinds.
///
/// # Invariants
/// - Variants are stable for serialization and registry lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Classify the change request and score its complexity.
    Triage,
    /// Produce an implementation plan.
    Plan,
    /// Produce a concrete code mutation.
    Code,
    /// Resolve conflicts against the current target state.
    Resolve,
    /// Review the accumulated artifacts.
    Review,
}

impl StageKind {
    /// Returns the stable snake_case label for the stage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Triage => "triage",
            Self::Plan => "plan",
            Self::Code => "code",
            Self::Resolve => "resolve",
            Self::Review => "review",
        }
    }
}

// ============================================================================
// SECTION: Model Tier
// ============================================================================

/// Language-model tier selected for a stage invocation.
///
/// # Invariants
/// - Variants are stable for serialization; the selection is recorded on the
///   step document for replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Fast, inexpensive tier for classification work.
    Light,
    /// Default tier.
    Standard,
    /// Highest-capability tier for complex code work.
    Heavy,
}

// ============================================================================
// SECTION: Step Status
// ============================================================================

/// Step lifecycle status.
///
/// # Invariants
/// - Variants are stable for serialization and index queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Appended and not yet started.
    Pending,
    /// Currently executing.
    Running,
    /// Terminal: produced a valid output artifact.
    Succeeded,
    /// Failed but eligible for re-scheduling.
    FailedRetryable,
    /// Terminal: failed with no retry path.
    FailedTerminal,
    /// Terminal: skipped due to cancellation.
    Skipped,
}

impl StepStatus {
    /// Returns true for terminal statuses.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::FailedTerminal | Self::Skipped)
    }
}

// ============================================================================
// SECTION: Transition Table
// ============================================================================

/// Returns the exact set of statuses reachable from `from`.
#[must_use]
pub const fn allowed_step_transitions(from: StepStatus) -> &'static [StepStatus] {
    match from {
        StepStatus::Pending => &[StepStatus::Running, StepStatus::Skipped],
        StepStatus::Running => &[
            StepStatus::Succeeded,
            StepStatus::FailedRetryable,
            StepStatus::FailedTerminal,
            StepStatus::Skipped,
        ],
        StepStatus::FailedRetryable => &[StepStatus::Running, StepStatus::FailedTerminal],
        StepStatus::Succeeded | StepStatus::FailedTerminal | StepStatus::Skipped => &[],
    }
}

/// Validates a step status transition against the table.
///
/// # Errors
///
/// Returns [`InvalidStepStatusTransition`] carrying the allowed set when the
/// edge is not in the table.
pub fn validate_step_transition(
    from: StepStatus,
    to: StepStatus,
) -> Result<(), InvalidStepStatusTransition> {
    let allowed = allowed_step_transitions(from);
    if allowed.contains(&to) {
        Ok(())
    } else {
        Err(InvalidStepStatusTransition {
            from,
            to,
            allowed: allowed.to_vec(),
        })
    }
}

/// Rejected step status transition.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("illegal step transition {from:?} -> {to:?}")]
pub struct InvalidStepStatusTransition {
    /// Status the step currently holds.
    pub from: StepStatus,
    /// Status the caller attempted to persist.
    pub to: StepStatus,
    /// Exact set of legal destination statuses.
    pub allowed: Vec<StepStatus>,
}

// ============================================================================
// SECTION: Step Artifact
// ============================================================================

/// Output artifact produced by a completed step.
///
/// # Invariants
/// - `hash` is the canonical hash of the artifact content.
/// - Exactly one of `inline` or `blob_ref` carries the content; large
///   payloads live behind a blob pointer so checkpoints stay small.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepArtifact {
    /// Canonical hash of the artifact content.
    pub hash: HashDigest,
    /// Inline JSON content for small artifacts.
    pub inline: Option<Value>,
    /// Blob store pointer for large artifacts.
    pub blob_ref: Option<String>,
}

impl StepArtifact {
    /// Creates an inline artifact from a JSON value and its hash.
    #[must_use]
    pub const fn inline(hash: HashDigest, value: Value) -> Self {
        Self {
            hash,
            inline: Some(value),
            blob_ref: None,
        }
    }
}

// ============================================================================
// SECTION: Step Document
// ============================================================================

/// One stage execution within a run.
///
/// # Invariants
/// - `ordinal` values within a run are exactly `0..n` with no gaps.
/// - `status` only changes along [`allowed_step_transitions`] edges.
/// - `attempts` counts `running` entries, including retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Step identifier.
    pub step_id: StepId,
    /// Owning run identifier.
    pub run_id: RunId,
    /// Dense ordinal within the run.
    pub ordinal: u32,
    /// Stage kind executed by the step.
    pub stage: StageKind,
    /// Current lifecycle status.
    pub status: StepStatus,
    /// Canonical hash of the stage input snapshot.
    pub input_hash: HashDigest,
    /// Output artifact for succeeded steps.
    pub output: Option<StepArtifact>,
    /// Model tier selected for the stage invocation.
    pub model_tier: Option<ModelTier>,
    /// Timestamp of the first `running` entry.
    pub started_at: Option<Timestamp>,
    /// Timestamp of the terminal transition.
    pub ended_at: Option<Timestamp>,
    /// Number of execution attempts.
    pub attempts: u32,
    /// Structured failure record for failed steps.
    pub error: Option<ErrorRecord>,
}
