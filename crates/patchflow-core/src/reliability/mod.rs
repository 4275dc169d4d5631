// crates/patchflow-core/src/reliability/mod.rs
// ============================================================================
// Module: Patchflow Reliability Kernel
// Description: Retry, circuit breaking, rate limiting, and their composition.
// Purpose: Wrap outbound calls with a fixed, safe guard ordering.
// Dependencies: crate::reliability submodules
// ============================================================================

//! ## Overview
//! [`guarded_call`] composes the guards in a fixed order:
//! rate limit, then retry, then breaker, then the call. Two consequences of
//! the ordering are load-bearing: rate-limit rejections surface before the
//! retry loop so they are never retried as if transient, and an
//! already-open breaker fails the call before the limiter runs so breaker
//! opens never consume rate-limit budget (the `circuit_open` error is also
//! non-retryable, so it never burns the retry schedule).

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod breaker;
pub mod rate_limit;
pub mod retry;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use breaker::BreakerConfig;
pub use breaker::BreakerRegistry;
pub use breaker::BreakerState;
pub use breaker::CircuitBreaker;
pub use rate_limit::DocumentRateLimitStore;
pub use rate_limit::InMemoryRateLimitStore;
pub use rate_limit::RateDecision;
pub use rate_limit::RateLimitConfig;
pub use rate_limit::RateLimitError;
pub use rate_limit::RateLimitStore;
pub use rate_limit::SlidingWindowLimiter;
pub use retry::FAST;
pub use retry::PATIENT;
pub use retry::RetryPolicy;
pub use retry::STANDARD;
pub use retry::run_with_retry;

// ============================================================================
// SECTION: Imports
// ============================================================================

use rand::RngCore;

use crate::core::CoreError;
use crate::core::TenantId;
use crate::interfaces::Clock;
use crate::interfaces::Sleeper;

// ============================================================================
// SECTION: Composition
// ============================================================================

/// Runs an operation under rate limit, retry, and breaker guards.
///
/// The limiter is optional so internal calls can share the retry/breaker
/// path without consuming tenant budget.
///
/// # Errors
///
/// Returns the limiter's `rate_limited` error without invoking the
/// operation, the breaker's `circuit_open` error while open, or the
/// operation's final classified error once retries are exhausted.
pub fn guarded_call<T, R, F>(
    limiter: Option<(&SlidingWindowLimiter<R>, &TenantId, &str)>,
    policy: &RetryPolicy,
    breaker: &CircuitBreaker,
    clock: &dyn Clock,
    sleeper: &dyn Sleeper,
    rng: &mut dyn RngCore,
    mut operation: F,
) -> Result<T, CoreError>
where
    R: RateLimitStore,
    F: FnMut(u32) -> Result<T, CoreError>,
{
    // Fast-fail on an already-open breaker before spending limiter budget.
    breaker.admit(clock.now())?;

    if let Some((limiter, tenant_id, operation_name)) = limiter {
        limiter.check(tenant_id, operation_name, clock.now())?;
    }

    run_with_retry(policy, sleeper, rng, |attempt| {
        let now = clock.now();
        breaker.admit(now)?;
        match operation(attempt) {
            Ok(value) => {
                breaker.record_success(clock.now());
                Ok(value)
            }
            Err(error) => {
                breaker.record_failure(clock.now());
                Err(error)
            }
        }
    })
}
