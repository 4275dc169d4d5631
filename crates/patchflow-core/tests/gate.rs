// crates/patchflow-core/tests/gate.rs
// ============================================================================
// Module: Approval Gate Tests
// Description: Tests for signed, hash-bound approval decisions.
// Purpose: Validate signature checks, hash binding, strict expiry, and the
//          expiry sweep.
// Dependencies: ed25519-dalek, patchflow-core
// ============================================================================

//! ## Overview
//! Drives the gate with real Ed25519 signatures: valid approvals unblock
//! runs, forged or rebound decisions are refused with stable reasons while
//! the run stays parked, expiry is strict at the boundary, and the sweep
//! fails runs whose pending approval lapsed. Every rejection lands on the
//! audit chain.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    reason = "Test-only panic-based assertions are permitted."
)]

mod common;

use common::RecordingBus;
use common::StubConnector;
use common::TENANT;
use common::TestKeyring;
use common::engine_fixture;
use common::sign_decision;
use common::signing_key;
use common::spawn_run;
use common::test_rng;
use patchflow_core::ApprovalDecision;
use patchflow_core::ApprovalGate;
use patchflow_core::ApprovalStatus;
use patchflow_core::AuditEventKind;
use patchflow_core::Capability;
use patchflow_core::DecisionPayload;
use patchflow_core::GateError;
use patchflow_core::HostMutation;
use patchflow_core::MemoryStore;
use patchflow_core::Run;
use patchflow_core::RunStatus;
use patchflow_core::RunStateEngine;
use patchflow_core::TenantId;
use patchflow_core::Timestamp;
use patchflow_core::TriggerOrigin;
use patchflow_core::WorkflowKind;
use patchflow_core::hash_bytes;
use patchflow_core::ledger;

/// Base test time.
const T0: Timestamp = Timestamp::from_unix_millis(1_700_000_000_000);

/// Approval TTL used across tests.
const TTL: i64 = 3_600_000;

/// Gate fixture with one registered approver.
struct GateFixture {
    /// Engine over the shared store.
    engine: RunStateEngine<MemoryStore, RecordingBus>,
    /// Gate under test.
    gate: ApprovalGate<MemoryStore, RecordingBus, TestKeyring>,
    /// Parked run awaiting approval.
    run: Run,
    /// Mutation bound by the pending approval.
    mutation: HostMutation,
}

/// Builds a run parked on a pending approval for a merge mutation.
fn parked_fixture() -> GateFixture {
    let (engine, _store, _bus) = engine_fixture();
    let mut keyring = TestKeyring::default();
    keyring.register(TENANT, "alice", signing_key(1).verifying_key());
    let gate = ApprovalGate::new(engine.clone(), keyring, TTL);

    let run = spawn_run(&engine, WorkflowKind::Autopilot, TriggerOrigin::Api, "a", T0);
    engine.transition_run(&run.run_id, RunStatus::Running, None, None, T0).expect("start");

    let mutation = HostMutation {
        capability: Capability::Merge,
        target: run.target.clone(),
        payload: b"{\"base\":\"main\",\"head\":\"fix\"}".to_vec(),
        content_type: "application/json".to_string(),
    };
    gate.request_approval(&run, &mutation, T0, &mut test_rng()).expect("request");
    let run = engine
        .transition_run(
            &run.run_id,
            RunStatus::AwaitingApproval,
            None,
            None,
            T0.plus_millis(1),
        )
        .expect("park");
    GateFixture {
        engine,
        gate,
        run,
        mutation,
    }
}

/// Builds the canonical decision payload for a fixture.
fn payload_for(fixture: &GateFixture, decision: ApprovalDecision, signed_at: Timestamp) -> DecisionPayload {
    DecisionPayload {
        run_id: fixture.run.run_id.clone(),
        capability: fixture.mutation.capability,
        target: fixture.mutation.target.clone(),
        artifact_hash: hash_bytes(&fixture.mutation.payload),
        decision,
        signed_at,
    }
}

/// Verifies a valid approval unblocks the run.
#[test]
fn valid_approval_unblocks_run() {
    let fixture = parked_fixture();
    let payload = payload_for(&fixture, ApprovalDecision::Approve, T0.plus_millis(100));
    let decision = sign_decision(&signing_key(1), payload, "alice", None);

    let outcome = fixture.gate.decide(&decision, T0.plus_millis(100)).expect("approve");
    assert_eq!(outcome.record.status, ApprovalStatus::Approved);
    assert_eq!(outcome.run.status, RunStatus::Running);
}

/// Verifies a rejection fails the run with the denial code.
#[test]
fn rejection_fails_run_with_denial_code() {
    let fixture = parked_fixture();
    let payload = payload_for(&fixture, ApprovalDecision::Reject, T0.plus_millis(100));
    let decision =
        sign_decision(&signing_key(1), payload, "alice", Some("too risky".to_string()));

    let outcome = fixture.gate.decide(&decision, T0.plus_millis(100)).expect("reject");
    assert_eq!(outcome.record.status, ApprovalStatus::Rejected);
    assert_eq!(outcome.run.status, RunStatus::Failed);
    let error = outcome.run.error.expect("error record");
    assert_eq!(error.code, "approval_denied");
}

/// Verifies the hash-binding scenario: a decision carrying the original
/// hash cannot authorize mutated artifact bytes.
#[test]
fn mutated_artifact_cannot_ride_an_earlier_hash() {
    let fixture = parked_fixture();

    // Approve against the original bytes.
    let payload = payload_for(&fixture, ApprovalDecision::Approve, T0.plus_millis(100));
    let decision = sign_decision(&signing_key(1), payload, "alice", None);
    fixture.gate.decide(&decision, T0.plus_millis(100)).expect("approve");

    // The applied payload was mutated after approval; dispatch must refuse.
    let connector = StubConnector::new();
    let mut tampered = fixture.mutation.clone();
    tampered.payload = b"{\"base\":\"main\",\"head\":\"backdoor\"}".to_vec();
    let err = fixture
        .gate
        .dispatch_guarded(&connector, &fixture.run, &tampered, T0.plus_millis(200))
        .expect_err("hash mismatch");
    match err {
        GateError::Invalid {
            reason,
        } => assert_eq!(reason, "hash_mismatch"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(connector.recorded().is_empty());

    // The untouched payload dispatches.
    fixture
        .gate
        .dispatch_guarded(&connector, &fixture.run, &fixture.mutation, T0.plus_millis(201))
        .expect("original bytes dispatch");
    assert_eq!(connector.recorded().len(), 1);
}

/// Verifies a decision referencing a stale hash leaves the run parked.
#[test]
fn stale_hash_decision_is_refused_and_run_stays_parked() {
    let fixture = parked_fixture();
    let mut payload = payload_for(&fixture, ApprovalDecision::Approve, T0.plus_millis(100));
    payload.artifact_hash = hash_bytes(b"different payload");
    let decision = sign_decision(&signing_key(1), payload, "alice", None);

    let err = fixture.gate.decide(&decision, T0.plus_millis(100)).expect_err("mismatch");
    match err {
        GateError::Invalid {
            reason,
        } => assert_eq!(reason, "hash_mismatch"),
        other => panic!("unexpected error: {other:?}"),
    }

    let run = fixture
        .engine
        .get_run(&fixture.run.run_id, T0.plus_millis(101))
        .expect("reload");
    assert_eq!(run.status, RunStatus::AwaitingApproval);

    let chain = ledger::load_chain(fixture.engine.store(), &TenantId::new(TENANT), T0.plus_millis(102))
        .expect("chain");
    assert!(chain.iter().any(|event| event.kind == AuditEventKind::GateRejected));
}

/// Verifies an unknown approver is refused.
#[test]
fn unknown_approver_is_refused() {
    let fixture = parked_fixture();
    let payload = payload_for(&fixture, ApprovalDecision::Approve, T0.plus_millis(100));
    let decision = sign_decision(&signing_key(9), payload, "mallory", None);
    let err = fixture.gate.decide(&decision, T0.plus_millis(100)).expect_err("unknown");
    assert!(matches!(
        err,
        GateError::Invalid {
            reason: "unknown_approver",
        }
    ));
}

/// Verifies a signature from the wrong key is refused.
#[test]
fn wrong_key_signature_is_refused() {
    let fixture = parked_fixture();
    let payload = payload_for(&fixture, ApprovalDecision::Approve, T0.plus_millis(100));
    // Signed by key 9 but attributed to alice, whose key is key 1.
    let decision = sign_decision(&signing_key(9), payload, "alice", None);
    let err = fixture.gate.decide(&decision, T0.plus_millis(100)).expect_err("forged");
    assert!(matches!(
        err,
        GateError::Invalid {
            reason: "signature_invalid",
        }
    ));
}

/// Verifies an approver without the capability grant is refused.
#[test]
fn unauthorized_capability_is_refused() {
    let (engine, _store, _bus) = engine_fixture();
    let mut keyring = TestKeyring::default();
    keyring.register_scoped(
        TENANT,
        "bob",
        signing_key(2).verifying_key(),
        vec![Capability::Comment, Capability::OpenPr],
    );
    let gate = ApprovalGate::new(engine.clone(), keyring, TTL);

    let run = spawn_run(&engine, WorkflowKind::Autopilot, TriggerOrigin::Api, "a", T0);
    engine.transition_run(&run.run_id, RunStatus::Running, None, None, T0).expect("start");
    let mutation = HostMutation {
        capability: Capability::Merge,
        target: run.target.clone(),
        payload: b"{}".to_vec(),
        content_type: "application/json".to_string(),
    };
    gate.request_approval(&run, &mutation, T0, &mut test_rng()).expect("request");
    engine
        .transition_run(&run.run_id, RunStatus::AwaitingApproval, None, None, T0.plus_millis(1))
        .expect("park");

    let payload = DecisionPayload {
        run_id: run.run_id.clone(),
        capability: Capability::Merge,
        target: mutation.target.clone(),
        artifact_hash: hash_bytes(&mutation.payload),
        decision: ApprovalDecision::Approve,
        signed_at: T0.plus_millis(100),
    };
    let decision = sign_decision(&signing_key(2), payload, "bob", None);
    let err = gate.decide(&decision, T0.plus_millis(100)).expect_err("unauthorized");
    assert!(matches!(
        err,
        GateError::Invalid {
            reason: "unauthorized_approver",
        }
    ));
}

/// Verifies expiry is strict: a decision arriving exactly at `expires_at`
/// is already late.
#[test]
fn expiry_boundary_is_strict() {
    let fixture = parked_fixture();
    let boundary = T0.plus_millis(TTL);
    let payload = payload_for(&fixture, ApprovalDecision::Approve, boundary);
    let decision = sign_decision(&signing_key(1), payload, "alice", None);

    let err = fixture.gate.decide(&decision, boundary).expect_err("expired at boundary");
    assert!(matches!(
        err,
        GateError::Invalid {
            reason: "expired",
        }
    ));
}

/// Verifies non-destructive mutations need no approval record.
#[test]
fn comment_capability_needs_no_approval() {
    let fixture = parked_fixture();
    let comment = HostMutation {
        capability: Capability::Comment,
        target: fixture.run.target.clone(),
        payload: b"{\"body\":\"looks good\"}".to_vec(),
        content_type: "application/json".to_string(),
    };
    let err = fixture
        .gate
        .request_approval(&fixture.run, &comment, T0, &mut test_rng())
        .expect_err("non-destructive");
    assert!(matches!(err, GateError::NonDestructiveCapability(_)));

    let connector = StubConnector::new();
    fixture
        .gate
        .dispatch_guarded(&connector, &fixture.run, &comment, T0.plus_millis(5))
        .expect("comments dispatch without approval");
    assert_eq!(connector.recorded().len(), 1);
}

/// Verifies the sweep expires lapsed approvals and fails their runs.
#[test]
fn sweep_fails_runs_with_lapsed_approvals() {
    let fixture = parked_fixture();
    let tenant = TenantId::new(TENANT);

    // Before expiry the sweep is a no-op.
    let untouched = fixture.gate.sweep_expired(&tenant, T0.plus_millis(TTL - 1)).expect("sweep");
    assert!(untouched.is_empty());

    let expired = fixture.gate.sweep_expired(&tenant, T0.plus_millis(TTL)).expect("sweep");
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].status, ApprovalStatus::Expired);

    let run = fixture
        .engine
        .get_run(&fixture.run.run_id, T0.plus_millis(TTL + 1))
        .expect("reload");
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.expect("error record").code, "approval_expired");
}
