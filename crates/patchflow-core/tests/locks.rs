// crates/patchflow-core/tests/locks.rs
// ============================================================================
// Module: Run Lock Tests
// Description: Tests for exclusive run locks with heartbeat and takeover.
// Purpose: Validate that at most one live lock exists per run.
// Dependencies: patchflow-core
// ============================================================================

//! ## Overview
//! Exercises lock acquisition, exclusivity against a live holder, heartbeat
//! extension, expiry takeover at the boundary, and release semantics for
//! holders and non-holders.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    reason = "Test-only panic-based assertions are permitted."
)]

mod common;

use common::TENANT;
use patchflow_core::LockError;
use patchflow_core::LockManager;
use patchflow_core::MemoryStore;
use patchflow_core::RunId;
use patchflow_core::TenantId;
use patchflow_core::Timestamp;
use patchflow_core::WorkerId;

/// Base test time.
const T0: Timestamp = Timestamp::from_unix_millis(1_700_000_000_000);

/// Lock TTL used across tests.
const TTL: i64 = 30_000;

/// Builds a lock manager over a fresh store.
fn manager() -> LockManager<MemoryStore> {
    LockManager::with_ttl(MemoryStore::new(), TTL)
}

/// Verifies acquisition and exclusion of a second worker.
#[test]
fn second_worker_is_excluded_while_lock_lives() {
    let locks = manager();
    let run_id = RunId::new("run-1");
    let tenant = TenantId::new(TENANT);

    let lock = locks.acquire(&run_id, &WorkerId::new("w1"), &tenant, T0).expect("acquire");
    assert_eq!(lock.expires_at, T0.plus_millis(TTL));

    let err = locks
        .acquire(&run_id, &WorkerId::new("w2"), &tenant, T0.plus_millis(TTL - 1))
        .expect_err("live lock excludes");
    match err {
        LockError::Held {
            holder,
        } => assert_eq!(holder, WorkerId::new("w1")),
        other => panic!("unexpected error: {other:?}"),
    }
}

/// Verifies heartbeat extends the TTL for the holder only.
#[test]
fn heartbeat_extends_for_holder_only() {
    let locks = manager();
    let run_id = RunId::new("run-1");
    let tenant = TenantId::new(TENANT);
    locks.acquire(&run_id, &WorkerId::new("w1"), &tenant, T0).expect("acquire");

    let extended = locks
        .heartbeat(&run_id, &WorkerId::new("w1"), &tenant, T0.plus_millis(10_000))
        .expect("heartbeat");
    assert_eq!(extended.expires_at, T0.plus_millis(10_000 + TTL));

    let err = locks
        .heartbeat(&run_id, &WorkerId::new("w2"), &tenant, T0.plus_millis(11_000))
        .expect_err("non-holder heartbeat");
    assert!(matches!(err, LockError::NotHolder));
}

/// Verifies a lock expiring exactly now is eligible for takeover.
#[test]
fn expired_lock_is_taken_over_at_boundary() {
    let locks = manager();
    let run_id = RunId::new("run-1");
    let tenant = TenantId::new(TENANT);
    locks.acquire(&run_id, &WorkerId::new("w1"), &tenant, T0).expect("acquire");

    let boundary = T0.plus_millis(TTL);
    let taken = locks
        .acquire(&run_id, &WorkerId::new("w2"), &tenant, boundary)
        .expect("takeover at boundary");
    assert_eq!(taken.holder, WorkerId::new("w2"));

    // The old holder's heartbeat now fails.
    let err = locks
        .heartbeat(&run_id, &WorkerId::new("w1"), &tenant, boundary.plus_millis(1))
        .expect_err("stale holder");
    assert!(matches!(err, LockError::NotHolder));
}

/// Verifies release by a non-holder is a harmless no-op.
#[test]
fn release_by_non_holder_is_noop() {
    let locks = manager();
    let run_id = RunId::new("run-1");
    let tenant = TenantId::new(TENANT);
    locks.acquire(&run_id, &WorkerId::new("w1"), &tenant, T0).expect("acquire");

    locks.release(&run_id, &WorkerId::new("w2"), T0.plus_millis(1)).expect("noop release");
    let current = locks.current(&run_id, T0.plus_millis(2)).expect("current");
    assert_eq!(current.map(|lock| lock.holder), Some(WorkerId::new("w1")));

    locks.release(&run_id, &WorkerId::new("w1"), T0.plus_millis(3)).expect("release");
    assert!(locks.current(&run_id, T0.plus_millis(4)).expect("cleared").is_none());
}

/// Verifies re-acquisition by the live holder extends the lock.
#[test]
fn holder_reacquisition_extends() {
    let locks = manager();
    let run_id = RunId::new("run-1");
    let tenant = TenantId::new(TENANT);
    locks.acquire(&run_id, &WorkerId::new("w1"), &tenant, T0).expect("acquire");
    let again = locks
        .acquire(&run_id, &WorkerId::new("w1"), &tenant, T0.plus_millis(5_000))
        .expect("reacquire");
    assert_eq!(again.expires_at, T0.plus_millis(5_000 + TTL));
}
