// crates/patchflow-core/src/core/checkpoint.rs
// ============================================================================
// Module: Patchflow Checkpoints
// Description: Durable resume snapshots written after step completions.
// Purpose: Make crash resume a pure function of stored state.
// Dependencies: crate::core::{identifiers, step, time}, serde
// ============================================================================

//! ## Overview
//! A checkpoint is a durable snapshot of run progress written after each
//! successful step and after every approval decision. The snapshot is
//! sufficient to recompute the next scheduled step without consulting any
//! external service: it carries the last completed ordinal and the
//! accumulated stage artifacts keyed by stage label. Checkpoints hold
//! artifact hashes and small inline values, never copies of large payloads.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::core::identifiers::RunId;
use crate::core::step::StepArtifact;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Checkpoint Document
// ============================================================================

/// Durable resume snapshot for a run.
///
/// # Invariants
/// - `last_completed_ordinal` is `None` before any step completes.
/// - `artifacts` is keyed by stage label and accumulates monotonically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Owning run identifier.
    pub run_id: RunId,
    /// Ordinal of the last step that completed successfully.
    pub last_completed_ordinal: Option<u32>,
    /// Accumulated stage artifacts keyed by stage label.
    pub artifacts: BTreeMap<String, StepArtifact>,
    /// Timestamp of the snapshot write.
    pub written_at: Timestamp,
}

impl Checkpoint {
    /// Returns the document id for a run's checkpoint.
    ///
    /// One checkpoint document exists per run; each write replaces the
    /// prior snapshot.
    #[must_use]
    pub fn document_id(run_id: &RunId) -> String {
        format!("ckpt-{}", run_id.as_str())
    }

    /// Creates the empty initial checkpoint for a run.
    #[must_use]
    pub const fn initial(run_id: RunId, written_at: Timestamp) -> Self {
        Self {
            run_id,
            last_completed_ordinal: None,
            artifacts: BTreeMap::new(),
            written_at,
        }
    }

    /// Returns the ordinal the next scheduled step should use.
    #[must_use]
    pub fn next_ordinal(&self) -> u32 {
        self.last_completed_ordinal.map_or(0, |ordinal| ordinal + 1)
    }
}
