// crates/patchflow-core/tests/ledger.rs
// ============================================================================
// Module: Audit Ledger Tests
// Description: Tests for hash-chain append and verification.
// Purpose: Validate tamper evidence and per-tenant linearization.
// Dependencies: patchflow-core
// ============================================================================

//! ## Overview
//! Appends events through the ledger and checks the chain invariants: dense
//! sequences, genesis linkage, prev-hash correctness, and fail-closed
//! verification when any persisted byte changes.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    reason = "Test-only panic-based assertions are permitted."
)]

mod common;

use common::RecordingBus;
use common::TENANT;
use common::fingerprint;
use patchflow_core::AuditEventKind;
use patchflow_core::GENESIS_PREV_HASH;
use patchflow_core::MemoryStore;
use patchflow_core::RunId;
use patchflow_core::TenantId;
use patchflow_core::Timestamp;
use patchflow_core::ledger;

/// Base test time.
const T0: Timestamp = Timestamp::from_unix_millis(1_700_000_000_000);

/// Appends `count` events for a tenant.
fn append_events(store: &MemoryStore, bus: &RecordingBus, tenant: &TenantId, count: u64) {
    for index in 0..count {
        ledger::append(
            store,
            bus,
            tenant,
            Some(&RunId::new("run-1")),
            "engine",
            AuditEventKind::RunTransitioned,
            fingerprint(&format!("payload-{index}")),
            T0.plus_millis(i64::try_from(index).expect("small index")),
        )
        .expect("append");
    }
}

/// Verifies chain linkage from genesis through each append.
#[test]
fn chain_links_from_genesis() {
    let store = MemoryStore::new();
    let bus = RecordingBus::default();
    let tenant = TenantId::new(TENANT);
    append_events(&store, &bus, &tenant, 3);

    let events = ledger::load_chain(&store, &tenant, T0.plus_millis(100)).expect("chain");
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].seq, 0);
    assert_eq!(events[0].prev_hash, GENESIS_PREV_HASH);
    for pair in events.windows(2) {
        let expected = ledger::chain_hash(&pair[0]).expect("hash");
        assert_eq!(pair[1].prev_hash, expected);
    }
    ledger::verify_chain(&events).expect("valid chain");
}

/// Verifies verification rejects a tampered payload hash.
#[test]
fn tampered_event_fails_verification() {
    let store = MemoryStore::new();
    let bus = RecordingBus::default();
    let tenant = TenantId::new(TENANT);
    append_events(&store, &bus, &tenant, 3);

    let mut events = ledger::load_chain(&store, &tenant, T0.plus_millis(100)).expect("chain");
    events[1].payload_hash = fingerprint("forged");
    let violation = ledger::verify_chain(&events).expect_err("tamper detected");
    assert_eq!(violation.seq, 2);
}

/// Verifies verification rejects a sequence gap.
#[test]
fn sequence_gap_fails_verification() {
    let store = MemoryStore::new();
    let bus = RecordingBus::default();
    let tenant = TenantId::new(TENANT);
    append_events(&store, &bus, &tenant, 3);

    let mut events = ledger::load_chain(&store, &tenant, T0.plus_millis(100)).expect("chain");
    events.remove(1);
    let violation = ledger::verify_chain(&events).expect_err("gap detected");
    assert_eq!(violation.seq, 2);
}

/// Verifies tenants hold independent chains.
#[test]
fn tenant_chains_are_independent() {
    let store = MemoryStore::new();
    let bus = RecordingBus::default();
    let tenant_a = TenantId::new("tenant-a");
    let tenant_b = TenantId::new("tenant-b");
    append_events(&store, &bus, &tenant_a, 2);
    append_events(&store, &bus, &tenant_b, 1);

    let chain_a = ledger::load_chain(&store, &tenant_a, T0.plus_millis(100)).expect("a");
    let chain_b = ledger::load_chain(&store, &tenant_b, T0.plus_millis(100)).expect("b");
    assert_eq!(chain_a.len(), 2);
    assert_eq!(chain_b.len(), 1);
    assert_eq!(chain_b[0].prev_hash, GENESIS_PREV_HASH);
    ledger::verify_chain(&chain_a).expect("a valid");
    ledger::verify_chain(&chain_b).expect("b valid");
}

/// Verifies an empty chain verifies trivially.
#[test]
fn empty_chain_is_valid() {
    ledger::verify_chain(&[]).expect("empty chain");
}
