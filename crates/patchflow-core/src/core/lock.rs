// crates/patchflow-core/src/core/lock.rs
// ============================================================================
// Module: Patchflow Run Locks
// Description: Exclusive, time-bounded mutation right over a run.
// Purpose: Serialize all mutations within a run across stateless workers.
// Dependencies: crate::core::{identifiers, time}, serde
// ============================================================================

//! ## Overview
//! Exactly one non-expired lock may exist per run at any instant. Holders
//! extend the TTL with heartbeats while working; a holder that misses its
//! heartbeat past the TTL loses the lock, and a new worker may take over
//! after reading the latest checkpoint and step set.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

use crate::core::identifiers::RunId;
use crate::core::identifiers::WorkerId;
use crate::core::time::MILLIS_PER_SECOND;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Lock TTL
// ============================================================================

/// Default run lock duration (60 seconds); heartbeats extend it.
pub const DEFAULT_RUN_LOCK_TTL_MILLIS: i64 = 60 * MILLIS_PER_SECOND;

// ============================================================================
// SECTION: Run Lock Document
// ============================================================================

/// Exclusive, time-bounded mutation right over a run.
///
/// # Invariants
/// - At most one non-expired lock exists per run.
/// - Only the holder mutates the lock before expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLock {
    /// Locked run identifier.
    pub run_id: RunId,
    /// Worker holding the lock.
    pub holder: WorkerId,
    /// Acquisition timestamp.
    pub acquired_at: Timestamp,
    /// Expiry timestamp; heartbeats push it forward.
    pub expires_at: Timestamp,
}

impl RunLock {
    /// Returns the document id for a run's lock.
    #[must_use]
    pub fn document_id(run_id: &RunId) -> String {
        format!("lock-{}", run_id.as_str())
    }

    /// Returns true when the lock has lapsed at `now`.
    ///
    /// A lock expiring exactly at `now` is lapsed; takeover eligibility is
    /// strict on the holder's side and inclusive on the taker's side.
    #[must_use]
    pub fn lapsed(&self, now: Timestamp) -> bool {
        !now.is_before(self.expires_at)
    }
}
