// crates/patchflow-core/tests/reliability.rs
// ============================================================================
// Module: Reliability Kernel Tests
// Description: Tests for retry, circuit breakers, rate limiting, and the
//              guard composition.
// Purpose: Validate classification, backoff bounds, breaker state flow, and
//          window boundaries.
// Dependencies: patchflow-core, proptest
// ============================================================================

//! ## Overview
//! Exercises the kernel end to end: retry stops on non-retryable errors,
//! jittered delays stay inside their exponential ceiling, breakers walk
//! closed, open, half-open, and back, the sliding window admits exactly its
//! limit, and the composed guard path refuses to retry rate-limit or open
//! circuit rejections.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    reason = "Test-only panic-based assertions are permitted."
)]

mod common;

use std::sync::Arc;
use std::sync::Mutex;

use common::InstantSleeper;
use common::ManualClock;
use common::TENANT;
use patchflow_core::BreakerConfig;
use patchflow_core::BreakerRegistry;
use patchflow_core::BreakerState;
use patchflow_core::CircuitBreaker;
use patchflow_core::CoreError;
use patchflow_core::ErrorKind;
use patchflow_core::RateLimitConfig;
use patchflow_core::SlidingWindowLimiter;
use patchflow_core::TenantId;
use patchflow_core::Timestamp;
use patchflow_core::reliability::DocumentRateLimitStore;
use patchflow_core::reliability::InMemoryRateLimitStore;
use patchflow_core::reliability::RetryPolicy;
use patchflow_core::reliability::STANDARD;
use patchflow_core::reliability::guarded_call;
use patchflow_core::reliability::run_with_retry;
use proptest::prelude::ProptestConfig;
use proptest::proptest;
use rand::SeedableRng;
use rand::rngs::StdRng;

/// Base test time.
const T0: Timestamp = Timestamp::from_unix_millis(1_700_000_000_000);

// ============================================================================
// SECTION: Retry
// ============================================================================

/// Verifies transient failures retry up to the attempt cap.
#[test]
fn transient_errors_retry_to_the_cap() {
    let sleeper = InstantSleeper::default();
    let mut rng = StdRng::seed_from_u64(1);
    let attempts = Arc::new(Mutex::new(0u32));

    let counted = Arc::clone(&attempts);
    let result: Result<(), CoreError> =
        run_with_retry(&STANDARD, &sleeper, &mut rng, move |_attempt| {
            *counted.lock().expect("counter") += 1;
            Err(CoreError::transient("upstream_5xx", "boom"))
        });

    let error = result.expect_err("exhausted");
    assert_eq!(error.code, "upstream_5xx");
    assert_eq!(*attempts.lock().expect("counter"), STANDARD.max_attempts);
    assert_eq!(sleeper.recorded().len() as u32, STANDARD.max_attempts - 1);
}

/// Verifies non-retryable errors escape on the first attempt.
#[test]
fn non_retryable_errors_bypass_retry() {
    let sleeper = InstantSleeper::default();
    let mut rng = StdRng::seed_from_u64(1);
    let attempts = Arc::new(Mutex::new(0u32));

    let counted = Arc::clone(&attempts);
    let result: Result<(), CoreError> =
        run_with_retry(&STANDARD, &sleeper, &mut rng, move |_attempt| {
            *counted.lock().expect("counter") += 1;
            Err(CoreError::validation("bad_input", "nope"))
        });

    assert!(result.is_err());
    assert_eq!(*attempts.lock().expect("counter"), 1);
    assert!(sleeper.recorded().is_empty());
}

/// Verifies success after transient failures returns the value.
#[test]
fn retry_succeeds_after_transient_failures() {
    let sleeper = InstantSleeper::default();
    let mut rng = StdRng::seed_from_u64(1);
    let attempts = Arc::new(Mutex::new(0u32));

    let counted = Arc::clone(&attempts);
    let result = run_with_retry(&STANDARD, &sleeper, &mut rng, move |_attempt| {
        let mut count = counted.lock().expect("counter");
        *count += 1;
        if *count < 3 {
            Err(CoreError::timeout("slow"))
        } else {
            Ok(*count)
        }
    });
    assert_eq!(result.expect("eventual success"), 3);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Jittered delays stay within `min(max_delay, base * 2^attempt)`.
    #[test]
    fn backoff_delay_respects_ceiling(seed in 0u64..1_000, attempt in 0u32..12) {
        let policy = RetryPolicy {
            max_attempts: 8,
            base_delay_millis: 100,
            max_delay_millis: 5_000,
        };
        let mut rng = StdRng::seed_from_u64(seed);
        let delay = policy.backoff_delay_millis(attempt, &mut rng);
        let ceiling = 100u64
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(5_000);
        assert!(delay <= ceiling, "delay {delay} above ceiling {ceiling}");
    }
}

// ============================================================================
// SECTION: Circuit Breaker
// ============================================================================

/// Breaker config used by the recovery-walk tests.
const SCENARIO_CONFIG: BreakerConfig = BreakerConfig {
    failure_threshold: 5,
    failure_rate_threshold: None,
    window_millis: 60_000,
    cooldown_millis: 30_000,
};

/// Verifies the open, half-open, close walk of the scenario.
#[test]
fn breaker_opens_after_threshold_and_recovers() {
    let breaker = CircuitBreaker::new("capability.llm", SCENARIO_CONFIG);

    for i in 0..5 {
        let now = T0.plus_millis(i);
        breaker.admit(now).expect("closed admits");
        breaker.record_failure(now);
    }
    assert_eq!(breaker.state(T0.plus_millis(5)), BreakerState::Open);

    // The sixth call fails immediately with the open-circuit rejection.
    let err = breaker.admit(T0.plus_millis(6)).expect_err("open rejects");
    assert_eq!(err.code, "circuit_open");
    assert!(!err.retryable);

    // After the cooldown the next call is admitted as the half-open probe.
    let probe_at = T0.plus_millis(5 + 30_000);
    breaker.admit(probe_at).expect("half-open probe admitted");
    assert_eq!(breaker.state(probe_at), BreakerState::HalfOpen);

    breaker.record_success(probe_at.plus_millis(1));
    assert_eq!(breaker.state(probe_at.plus_millis(2)), BreakerState::Closed);
}

/// Verifies a half-open failure reopens the breaker.
#[test]
fn half_open_failure_reopens() {
    let breaker = CircuitBreaker::new("capability.llm", SCENARIO_CONFIG);
    for i in 0..5 {
        breaker.record_failure(T0.plus_millis(i));
    }
    let probe_at = T0.plus_millis(4 + 30_000);
    breaker.admit(probe_at).expect("probe");
    breaker.record_failure(probe_at);
    assert_eq!(breaker.state(probe_at.plus_millis(1)), BreakerState::Open);
    assert!(breaker.admit(probe_at.plus_millis(2)).is_err());
}

/// Verifies the failure-rate trip over the rolling window.
#[test]
fn failure_rate_trips_the_breaker() {
    let breaker = CircuitBreaker::new(
        "capability.llm",
        BreakerConfig {
            failure_threshold: 4,
            failure_rate_threshold: Some(0.5),
            window_millis: 60_000,
            cooldown_millis: 30_000,
        },
    );

    // Alternate successes and failures: rate 0.5, no 4-run of failures.
    for i in 0..4 {
        let now = T0.plus_millis(i * 100);
        if i % 2 == 0 {
            breaker.record_failure(now);
        } else {
            breaker.record_success(now);
        }
    }
    breaker.record_failure(T0.plus_millis(500));
    assert_eq!(breaker.state(T0.plus_millis(600)), BreakerState::Open);
}

/// Verifies the registry shares breakers by name.
#[test]
fn registry_shares_breakers_by_name() {
    let registry = BreakerRegistry::new();
    let a = registry.named("capability.llm", SCENARIO_CONFIG);
    let b = registry.named("capability.llm", SCENARIO_CONFIG);
    for i in 0..5 {
        a.record_failure(T0.plus_millis(i));
    }
    assert_eq!(b.state(T0.plus_millis(10)), BreakerState::Open);

    let other = registry.named("capability.connector", SCENARIO_CONFIG);
    assert_eq!(other.state(T0.plus_millis(10)), BreakerState::Closed);
}

// ============================================================================
// SECTION: Rate Limiting
// ============================================================================

/// Limiter config used by the window-boundary tests.
const WINDOW_CONFIG: RateLimitConfig = RateLimitConfig {
    limit: 10,
    window_millis: 60_000,
};

/// Verifies the sliding-window scenario: 10 admitted, the 11th rejected,
/// readmission once the oldest sample leaves the window.
#[test]
fn sliding_window_admits_exactly_the_limit() {
    let limiter = SlidingWindowLimiter::new(InMemoryRateLimitStore::new(), WINDOW_CONFIG);
    let tenant = TenantId::new(TENANT);

    for second in 0..10 {
        limiter
            .check(&tenant, "runs", T0.plus_millis(second * 1_000))
            .expect("within limit");
    }
    let err = limiter
        .check(&tenant, "runs", T0.plus_millis(30_000))
        .expect_err("limit reached");
    assert_eq!(err.code, "rate_limited");
    assert_eq!(err.kind, ErrorKind::PolicyDenied);
    assert!(!err.retryable);

    // At t=61s the t=0 sample has expired.
    limiter.check(&tenant, "runs", T0.plus_millis(61_000)).expect("readmitted");
}

/// Verifies tenants consume independent budgets.
#[test]
fn rate_limits_are_tenant_isolated() {
    let limiter = SlidingWindowLimiter::new(
        InMemoryRateLimitStore::new(),
        RateLimitConfig {
            limit: 1,
            window_millis: 60_000,
        },
    );
    limiter.check(&TenantId::new("tenant-a"), "runs", T0).expect("a admitted");
    limiter.check(&TenantId::new("tenant-b"), "runs", T0).expect("b admitted");
    assert!(limiter.check(&TenantId::new("tenant-a"), "runs", T0).is_err());
}

/// Verifies the durable store enforces the same boundary semantics.
#[test]
fn document_store_limiter_matches_in_memory_semantics() {
    let store = DocumentRateLimitStore::new(patchflow_core::MemoryStore::new());
    let limiter = SlidingWindowLimiter::new(store, WINDOW_CONFIG);
    let tenant = TenantId::new(TENANT);

    for second in 0..10 {
        limiter
            .check(&tenant, "runs", T0.plus_millis(second * 1_000))
            .expect("within limit");
    }
    assert!(limiter.check(&tenant, "runs", T0.plus_millis(30_000)).is_err());
    limiter.check(&tenant, "runs", T0.plus_millis(61_000)).expect("readmitted");
}

// ============================================================================
// SECTION: Guard Composition
// ============================================================================

/// Verifies rate-limited rejections are not retried.
#[test]
fn rate_limited_rejections_are_not_retried() {
    let limiter = SlidingWindowLimiter::new(
        InMemoryRateLimitStore::new(),
        RateLimitConfig {
            limit: 1,
            window_millis: 60_000,
        },
    );
    let breaker = CircuitBreaker::new("capability.llm", SCENARIO_CONFIG);
    let clock = ManualClock::at(T0.as_unix_millis());
    let sleeper = InstantSleeper::default();
    let mut rng = StdRng::seed_from_u64(1);
    let tenant = TenantId::new(TENANT);
    let calls = Arc::new(Mutex::new(0u32));

    // First call consumes the only slot.
    let counted = Arc::clone(&calls);
    guarded_call(
        Some((&limiter, &tenant, "runs")),
        &STANDARD,
        &breaker,
        &clock,
        &sleeper,
        &mut rng,
        move |_attempt| {
            *counted.lock().expect("counter") += 1;
            Ok(())
        },
    )
    .expect("first call admitted");

    // Second call is rejected before the operation runs and never retried.
    let counted = Arc::clone(&calls);
    let err = guarded_call(
        Some((&limiter, &tenant, "runs")),
        &STANDARD,
        &breaker,
        &clock,
        &sleeper,
        &mut rng,
        move |_attempt| {
            *counted.lock().expect("counter") += 1;
            Ok(())
        },
    )
    .expect_err("rate limited");
    assert_eq!(err.code, "rate_limited");
    assert_eq!(*calls.lock().expect("counter"), 1);
    assert!(sleeper.recorded().is_empty());
}

/// Verifies an open breaker rejects before consuming limiter budget.
#[test]
fn open_breaker_preserves_rate_budget() {
    let limiter = SlidingWindowLimiter::new(
        InMemoryRateLimitStore::new(),
        RateLimitConfig {
            limit: 1,
            window_millis: 60_000,
        },
    );
    let breaker = CircuitBreaker::new("capability.llm", SCENARIO_CONFIG);
    for i in 0..5 {
        breaker.record_failure(T0.plus_millis(i));
    }
    let clock = ManualClock::at(T0.plus_millis(10).as_unix_millis());
    let sleeper = InstantSleeper::default();
    let mut rng = StdRng::seed_from_u64(1);
    let tenant = TenantId::new(TENANT);

    let err = guarded_call(
        Some((&limiter, &tenant, "runs")),
        &STANDARD,
        &breaker,
        &clock,
        &sleeper,
        &mut rng,
        |_attempt| Ok(()),
    )
    .expect_err("open circuit");
    assert_eq!(err.code, "circuit_open");

    // The limiter still has its slot.
    limiter.check(&tenant, "runs", T0.plus_millis(20)).expect("budget preserved");
}
