// crates/patchflow-http/src/clock.rs
// ============================================================================
// Module: Patchflow System Clock
// Description: Wall-clock and sleeper implementations for deployments.
// Purpose: Supply real time to the core, which never reads it directly.
// Dependencies: patchflow-core, std::time
// ============================================================================

//! ## Overview
//! The core consumes time exclusively through its [`Clock`] and [`Sleeper`]
//! ports. These are the production implementations; tests use manual
//! substitutes so every timestamp and delay is deterministic.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use patchflow_core::Clock;
use patchflow_core::Sleeper;
use patchflow_core::Timestamp;

// ============================================================================
// SECTION: System Clock
// ============================================================================

/// Wall-clock implementation over `SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX));
        Timestamp::from_unix_millis(millis)
    }
}

// ============================================================================
// SECTION: Thread Sleeper
// ============================================================================

/// Sleeper that blocks the current thread.
///
/// Workers run pipeline passes on blocking threads, so a thread sleep is
/// the correct suspension primitive here.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep_millis(&self, millis: u64) {
        std::thread::sleep(Duration::from_millis(millis));
    }
}
