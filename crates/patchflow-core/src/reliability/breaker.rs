// crates/patchflow-core/src/reliability/breaker.rs
// ============================================================================
// Module: Patchflow Circuit Breakers
// Description: Three-state named breakers with a per-process registry.
// Purpose: Fail fast against upstreams that are demonstrably down.
// Dependencies: crate::core, std::sync
// ============================================================================

//! ## Overview
//! Breakers move `closed -> open` after a run of consecutive failures or a
//! failure rate over a rolling window, `open -> half-open` once the cooldown
//! elapses, and from `half-open` to `closed` on the first success or back to
//! `open` on the first failure. Breakers are named and shared across callers
//! through [`BreakerRegistry`], the only process-wide state in the core; its
//! loss on restart is acceptable because breakers start closed and
//! rediscover failures.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use crate::core::CoreError;
use crate::core::Timestamp;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Circuit breaker parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Optional failure-rate trip over the rolling window, in `0.0..=1.0`.
    pub failure_rate_threshold: Option<f64>,
    /// Rolling window length for rate accounting, in milliseconds.
    pub window_millis: i64,
    /// Open-state cooldown before the half-open probe, in milliseconds.
    pub cooldown_millis: i64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: None,
            window_millis: 60_000,
            cooldown_millis: 30_000,
        }
    }
}

// ============================================================================
// SECTION: Breaker State
// ============================================================================

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow through; failures are counted.
    Closed,
    /// Calls fail fast until the cooldown elapses.
    Open,
    /// One probe window; the next outcome decides the state.
    HalfOpen,
}

/// Mutable breaker bookkeeping.
#[derive(Debug)]
struct BreakerInner {
    /// Current state.
    state: BreakerState,
    /// Consecutive failure count while closed.
    consecutive_failures: u32,
    /// Rolling window of `(time, failed)` samples.
    samples: VecDeque<(Timestamp, bool)>,
    /// When the breaker last opened.
    opened_at: Option<Timestamp>,
}

impl BreakerInner {
    /// Creates the closed initial state.
    const fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            samples: VecDeque::new(),
            opened_at: None,
        }
    }

    /// Drops samples older than the rolling window.
    fn prune(&mut self, window_millis: i64, now: Timestamp) {
        while let Some((time, _)) = self.samples.front() {
            if now.millis_since(*time) >= window_millis {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Returns the failure rate over the current window.
    fn failure_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let failures = self.samples.iter().filter(|(_, failed)| *failed).count();
        #[allow(
            clippy::cast_precision_loss,
            reason = "Sample counts stay far below the f64 mantissa range."
        )]
        let rate = failures as f64 / self.samples.len() as f64;
        rate
    }
}

// ============================================================================
// SECTION: Circuit Breaker
// ============================================================================

/// Named three-state circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Breaker name shared across callers.
    name: String,
    /// Trip and cooldown parameters.
    config: BreakerConfig,
    /// Guarded bookkeeping.
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    /// Returns the breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the observable state at `now`, surfacing cooldown expiry.
    #[must_use]
    pub fn state(&self, now: Timestamp) -> BreakerState {
        let Ok(mut inner) = self.inner.lock() else {
            return BreakerState::Open;
        };
        Self::roll_cooldown(&mut inner, self.config.cooldown_millis, now);
        inner.state
    }

    /// Admits or rejects a call at `now`.
    ///
    /// # Errors
    ///
    /// Returns the non-retryable `circuit_open` error while the breaker is
    /// open and the cooldown has not elapsed.
    pub fn admit(&self, now: Timestamp) -> Result<(), CoreError> {
        let mut inner = self.lock()?;
        Self::roll_cooldown(&mut inner, self.config.cooldown_millis, now);
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => Err(CoreError::circuit_open(self.name.clone())),
        }
    }

    /// Records a successful call.
    pub fn record_success(&self, now: Timestamp) {
        if let Ok(mut inner) = self.inner.lock() {
            Self::roll_cooldown(&mut inner, self.config.cooldown_millis, now);
            match inner.state {
                BreakerState::HalfOpen => {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.samples.clear();
                    inner.opened_at = None;
                }
                BreakerState::Closed => {
                    inner.consecutive_failures = 0;
                    inner.samples.push_back((now, false));
                    inner.prune(self.config.window_millis, now);
                }
                BreakerState::Open => {}
            }
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self, now: Timestamp) {
        if let Ok(mut inner) = self.inner.lock() {
            Self::roll_cooldown(&mut inner, self.config.cooldown_millis, now);
            match inner.state {
                BreakerState::HalfOpen => {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                }
                BreakerState::Closed => {
                    inner.consecutive_failures += 1;
                    inner.samples.push_back((now, true));
                    inner.prune(self.config.window_millis, now);

                    let consecutive_trip =
                        inner.consecutive_failures >= self.config.failure_threshold;
                    let rate_trip = self.config.failure_rate_threshold.is_some_and(|threshold| {
                        inner.samples.len() >= self.config.failure_threshold as usize
                            && inner.failure_rate() >= threshold
                    });
                    if consecutive_trip || rate_trip {
                        inner.state = BreakerState::Open;
                        inner.opened_at = Some(now);
                    }
                }
                BreakerState::Open => {}
            }
        }
    }

    /// Moves an open breaker to half-open once the cooldown elapses.
    fn roll_cooldown(inner: &mut BreakerInner, cooldown_millis: i64, now: Timestamp) {
        if inner.state == BreakerState::Open {
            let elapsed = inner
                .opened_at
                .is_none_or(|opened| now.millis_since(opened) >= cooldown_millis);
            if elapsed {
                inner.state = BreakerState::HalfOpen;
            }
        }
    }

    /// Locks the bookkeeping or reports mutex poisoning.
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BreakerInner>, CoreError> {
        self.inner
            .lock()
            .map_err(|_| CoreError::internal(format!("breaker {} mutex poisoned", self.name)))
    }
}

// ============================================================================
// SECTION: Registry
// ============================================================================

/// Per-process registry sharing breakers across callers by name.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    /// Named breakers.
    breakers: Mutex<BTreeMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the breaker registered under `name`, creating it with
    /// `config` on first use. Later callers share the first configuration.
    #[must_use]
    pub fn named(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let Ok(mut breakers) = self.breakers.lock() else {
            // A poisoned registry mutex falls back to an unshared breaker;
            // fail-fast behavior is preserved per caller.
            return Arc::new(CircuitBreaker::new(name, config));
        };
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config))),
        )
    }
}
