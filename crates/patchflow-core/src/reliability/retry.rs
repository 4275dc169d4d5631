// crates/patchflow-core/src/reliability/retry.rs
// ============================================================================
// Module: Patchflow Retry Executor
// Description: Exponential backoff with full jitter over classified errors.
// Purpose: Retry transient failures without synchronized thundering herds.
// Dependencies: crate::{core, interfaces}, rand
// ============================================================================

//! ## Overview
//! The retry executor reruns an operation while its failures are classified
//! retryable, sleeping `random(0, base * 2^attempt)` capped at `max_delay`
//! between attempts. Delays go through the injected [`Sleeper`] port and the
//! injected random source, so tests are instantaneous and deterministic.
//! Non-retryable errors escape on the first occurrence.

// ============================================================================
// SECTION: Imports
// ============================================================================

use rand::Rng;
use rand::RngCore;

use crate::core::CoreError;
use crate::interfaces::Sleeper;

// ============================================================================
// SECTION: Policy
// ============================================================================

/// Retry policy parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempt cap, including the first call.
    pub max_attempts: u32,
    /// Base delay in milliseconds.
    pub base_delay_millis: u64,
    /// Delay ceiling in milliseconds.
    pub max_delay_millis: u64,
}

/// Preset for quick interactive calls: 3 attempts, 100ms base, 5s cap.
pub const FAST: RetryPolicy = RetryPolicy {
    max_attempts: 3,
    base_delay_millis: 100,
    max_delay_millis: 5_000,
};

/// Default preset: 5 attempts, 500ms base, 30s cap.
pub const STANDARD: RetryPolicy = RetryPolicy {
    max_attempts: 5,
    base_delay_millis: 500,
    max_delay_millis: 30_000,
};

/// Preset for slow upstreams: 8 attempts, 1s base, 2m cap.
pub const PATIENT: RetryPolicy = RetryPolicy {
    max_attempts: 8,
    base_delay_millis: 1_000,
    max_delay_millis: 120_000,
};

impl RetryPolicy {
    /// Computes the jittered delay before the retry following `attempt`.
    ///
    /// Full jitter: uniform over `[0, min(max_delay, base * 2^attempt)]`.
    #[must_use]
    pub fn backoff_delay_millis(&self, attempt: u32, rng: &mut dyn RngCore) -> u64 {
        let exponential = 2u64.saturating_pow(attempt);
        let ceiling = self
            .base_delay_millis
            .saturating_mul(exponential)
            .min(self.max_delay_millis);
        rng.gen_range(0..=ceiling)
    }
}

// ============================================================================
// SECTION: Executor
// ============================================================================

/// Runs an operation under a retry policy.
///
/// The operation receives the zero-based attempt index. Only errors whose
/// `retryable` flag is set are retried; the final error is returned with an
/// attempt-count context entry.
///
/// # Errors
///
/// Returns the last [`CoreError`] once attempts are exhausted or a
/// non-retryable error occurs.
pub fn run_with_retry<T, F>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    rng: &mut dyn RngCore,
    mut operation: F,
) -> Result<T, CoreError>
where
    F: FnMut(u32) -> Result<T, CoreError>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempts_used = 0u32;
    let mut last_error: Option<CoreError> = None;
    for attempt in 0..attempts {
        attempts_used = attempt + 1;
        match operation(attempt) {
            Ok(value) => return Ok(value),
            Err(error) => {
                let retry = error.retryable && attempt + 1 < attempts;
                last_error = Some(error);
                if !retry {
                    break;
                }
                let delay = policy.backoff_delay_millis(attempt, rng);
                sleeper.sleep_millis(delay);
            }
        }
    }
    // The loop always stores an error before breaking or finishing.
    let error = last_error
        .unwrap_or_else(|| CoreError::internal("retry loop finished without outcome"));
    Err(error.with_context("attempts", attempts_used.to_string()))
}
