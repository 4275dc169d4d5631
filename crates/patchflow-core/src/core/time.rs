// crates/patchflow-core/src/core/time.rs
// ============================================================================
// Module: Patchflow Time Model
// Description: Canonical timestamp representation for runs, locks, and TTLs.
// Purpose: Provide deterministic, replayable time values across records.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Patchflow embeds explicit unix-millisecond timestamps in every persisted
//! record so crash recovery and audits replay deterministically. The core
//! never reads wall-clock time directly; hosts supply time through the
//! [`crate::interfaces::Clock`] port.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Timestamp
// ============================================================================

/// Canonical timestamp in unix milliseconds.
///
/// # Invariants
/// - Values are explicitly provided by callers; the core never reads
///   wall-clock time.
/// - Monotonicity within a worker is a caller responsibility.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Creates a timestamp from unix milliseconds.
    #[must_use]
    pub const fn from_unix_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as unix milliseconds.
    #[must_use]
    pub const fn as_unix_millis(&self) -> i64 {
        self.0
    }

    /// Returns the timestamp advanced by a millisecond duration.
    #[must_use]
    pub const fn plus_millis(&self, millis: i64) -> Self {
        Self(self.0.saturating_add(millis))
    }

    /// Returns the timestamp moved back by a millisecond duration.
    #[must_use]
    pub const fn minus_millis(&self, millis: i64) -> Self {
        Self(self.0.saturating_sub(millis))
    }

    /// Returns the signed millisecond distance from `earlier` to `self`.
    #[must_use]
    pub const fn millis_since(&self, earlier: Self) -> i64 {
        self.0.saturating_sub(earlier.0)
    }

    /// Returns true when `self` is strictly before `other`.
    #[must_use]
    pub const fn is_before(&self, other: Self) -> bool {
        self.0 < other.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// SECTION: Duration Constants
// ============================================================================

/// One second in milliseconds.
pub const MILLIS_PER_SECOND: i64 = 1_000;

/// One minute in milliseconds.
pub const MILLIS_PER_MINUTE: i64 = 60 * MILLIS_PER_SECOND;

/// One hour in milliseconds.
pub const MILLIS_PER_HOUR: i64 = 60 * MILLIS_PER_MINUTE;
