// crates/patchflow-core/tests/engine.rs
// ============================================================================
// Module: Run State Engine Tests
// Description: Tests for run creation, step lifecycle, and checkpoints.
// Purpose: Validate dense ordinals, transition enforcement, and resume
//          analysis.
// Dependencies: patchflow-core
// ============================================================================

//! ## Overview
//! Drives the engine through full run lifecycles over the in-memory store:
//! creation with fingerprint dedup, dense step ordinals, checkpoint writes
//! on success, illegal transitions leaving documents unchanged, and resume
//! analysis for interrupted steps.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    reason = "Test-only panic-based assertions are permitted."
)]

mod common;

use common::TENANT;
use common::engine_fixture;
use common::fingerprint;
use common::spawn_run;
use common::test_rng;
use patchflow_core::AuditEventKind;
use patchflow_core::EngineError;
use patchflow_core::RunStatus;
use patchflow_core::StageKind;
use patchflow_core::StepArtifact;
use patchflow_core::StepOutcome;
use patchflow_core::StepStatus;
use patchflow_core::TenantId;
use patchflow_core::Timestamp;
use patchflow_core::TriggerOrigin;
use patchflow_core::WorkerId;
use patchflow_core::WorkflowKind;
use patchflow_core::ledger;

/// Base test time.
const T0: Timestamp = Timestamp::from_unix_millis(1_700_000_000_000);

/// Verifies run creation writes the run and its initial checkpoint.
#[test]
fn create_run_writes_run_and_checkpoint() {
    let (engine, _store, bus) = engine_fixture();
    let run = spawn_run(&engine, WorkflowKind::Triage, TriggerOrigin::Api, "a", T0);

    assert_eq!(run.status, RunStatus::Pending);
    assert!(run.run_id.as_str().starts_with("run-"));
    assert!(run.step_ids.is_empty());

    let checkpoint = engine.latest_checkpoint(&run.run_id, T0).expect("checkpoint");
    assert_eq!(checkpoint.last_completed_ordinal, None);
    assert_eq!(checkpoint.next_ordinal(), 0);

    let events = ledger::load_chain(engine.store(), &TenantId::new(TENANT), T0).expect("chain");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, AuditEventKind::RunCreated);
    assert!(bus.topics().contains(&"audit.appended"));
}

/// Verifies webhook-triggered duplicates are rejected inside the window.
#[test]
fn webhook_duplicate_fingerprint_rejected_in_window() {
    let (engine, _store, _bus) = engine_fixture();
    let first = spawn_run(&engine, WorkflowKind::Triage, TriggerOrigin::Webhook, "same", T0);

    let err = engine
        .create_run(
            common::create_request(WorkflowKind::Triage, TriggerOrigin::Webhook, "same"),
            T0.plus_millis(1_000),
            &mut test_rng(),
        )
        .expect_err("duplicate inside window");
    match err {
        EngineError::DuplicateFingerprint {
            existing,
        } => assert_eq!(existing, first.run_id),
        other => panic!("unexpected error: {other:?}"),
    }

    // Outside the window the same fingerprint is a fresh run.
    engine
        .create_run(
            common::create_request(WorkflowKind::Triage, TriggerOrigin::Webhook, "same"),
            T0.plus_millis(20_000),
            &mut test_rng(),
        )
        .expect("fresh run outside window");
}

/// Verifies API triggers never dedup on fingerprint.
#[test]
fn api_trigger_skips_fingerprint_dedup() {
    let (engine, _store, _bus) = engine_fixture();
    spawn_run(&engine, WorkflowKind::Triage, TriggerOrigin::Api, "same", T0);
    spawn_run(&engine, WorkflowKind::Triage, TriggerOrigin::Api, "same", T0.plus_millis(1));
}

/// Verifies step ordinals are dense and appends require a running run.
#[test]
fn append_step_assigns_dense_ordinals() {
    let (engine, _store, _bus) = engine_fixture();
    let run = spawn_run(&engine, WorkflowKind::IssueToCode, TriggerOrigin::Api, "a", T0);

    let err = engine
        .append_step(&run.run_id, StageKind::Triage, fingerprint("in0"), T0)
        .expect_err("pending runs take no steps");
    assert!(matches!(err, EngineError::RunNotRunning(RunStatus::Pending)));

    engine.transition_run(&run.run_id, RunStatus::Running, None, None, T0).expect("start");
    let s0 = engine
        .append_step(&run.run_id, StageKind::Triage, fingerprint("in0"), T0)
        .expect("step 0");
    let s1 = engine
        .append_step(&run.run_id, StageKind::Plan, fingerprint("in1"), T0)
        .expect("step 1");
    assert_eq!(s0.ordinal, 0);
    assert_eq!(s1.ordinal, 1);

    let steps = engine.list_steps(&run.run_id, T0).expect("list");
    let ordinals: Vec<u32> = steps.iter().map(|step| step.ordinal).collect();
    assert_eq!(ordinals, vec![0, 1]);

    let run = engine.get_run(&run.run_id, T0).expect("reload");
    assert_eq!(run.step_ids, vec![s0.step_id.clone(), s1.step_id.clone()]);
}

/// Verifies step success writes the checkpoint with the artifact.
#[test]
fn step_success_advances_checkpoint() {
    let (engine, _store, bus) = engine_fixture();
    let run = spawn_run(&engine, WorkflowKind::Review, TriggerOrigin::Api, "a", T0);
    engine.transition_run(&run.run_id, RunStatus::Running, None, None, T0).expect("start");
    let step = engine
        .append_step(&run.run_id, StageKind::Triage, fingerprint("in"), T0)
        .expect("append");

    engine
        .update_step_status(
            &step.step_id,
            StepStatus::Running,
            StepOutcome::default(),
            T0.plus_millis(10),
        )
        .expect("run step");
    let artifact = StepArtifact::inline(
        fingerprint("out"),
        serde_json::json!({ "complexity_score": 10 }),
    );
    engine
        .update_step_status(
            &step.step_id,
            StepStatus::Succeeded,
            StepOutcome {
                output: Some(artifact.clone()),
                ..StepOutcome::default()
            },
            T0.plus_millis(20),
        )
        .expect("succeed step");

    let checkpoint = engine.latest_checkpoint(&run.run_id, T0.plus_millis(30)).expect("ckpt");
    assert_eq!(checkpoint.last_completed_ordinal, Some(0));
    assert_eq!(checkpoint.next_ordinal(), 1);
    assert_eq!(checkpoint.artifacts.get("triage"), Some(&artifact));
    assert!(bus.topics().contains(&"step.completed"));
}

/// Verifies illegal transitions leave the run document unchanged.
#[test]
fn illegal_transition_leaves_run_unchanged() {
    let (engine, _store, _bus) = engine_fixture();
    let run = spawn_run(&engine, WorkflowKind::Triage, TriggerOrigin::Api, "a", T0);
    engine.transition_run(&run.run_id, RunStatus::Running, None, None, T0).expect("start");
    engine
        .transition_run(&run.run_id, RunStatus::Completed, None, None, T0.plus_millis(1))
        .expect("complete");

    let before = engine.get_run(&run.run_id, T0.plus_millis(2)).expect("before");
    let err = engine
        .transition_run(&run.run_id, RunStatus::Running, None, None, T0.plus_millis(3))
        .expect_err("terminal runs have no edges");
    match err {
        EngineError::InvalidRunTransition(violation) => {
            assert_eq!(violation.from, RunStatus::Completed);
            assert_eq!(violation.to, RunStatus::Running);
            assert!(violation.allowed.is_empty());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    let after = engine.get_run(&run.run_id, T0.plus_millis(4)).expect("after");
    assert_eq!(before, after);
}

/// Verifies resume analysis reports the interrupted step and artifacts.
#[test]
fn resume_analysis_reports_interrupted_step() {
    let (engine, _store, _bus) = engine_fixture();
    let run = spawn_run(&engine, WorkflowKind::IssueToCode, TriggerOrigin::Api, "a", T0);
    engine.transition_run(&run.run_id, RunStatus::Running, None, None, T0).expect("start");

    // triage and plan complete, code is interrupted mid-flight.
    for (stage, label) in [(StageKind::Triage, "triage"), (StageKind::Plan, "plan")] {
        let step = engine
            .append_step(&run.run_id, stage, fingerprint(label), T0)
            .expect("append");
        engine
            .update_step_status(&step.step_id, StepStatus::Running, StepOutcome::default(), T0)
            .expect("run");
        engine
            .update_step_status(
                &step.step_id,
                StepStatus::Succeeded,
                StepOutcome {
                    output: Some(StepArtifact::inline(
                        fingerprint(label),
                        serde_json::json!({ "stage": label }),
                    )),
                    ..StepOutcome::default()
                },
                T0,
            )
            .expect("succeed");
    }
    let code = engine
        .append_step(&run.run_id, StageKind::Code, fingerprint("code"), T0)
        .expect("append code");
    engine
        .update_step_status(&code.step_id, StepStatus::Running, StepOutcome::default(), T0)
        .expect("run code");

    let resume = engine
        .analyze_resume_point(&run.run_id, &WorkerId::new("w2"), T0.plus_millis(100))
        .expect("resume point");
    assert_eq!(resume.resume_ordinal, 2);
    assert_eq!(resume.reason, patchflow_core::ResumeReason::InterruptedStep);
    assert!(resume.prior_artifacts.contains_key("triage"));
    assert!(resume.prior_artifacts.contains_key("plan"));
    assert!(!resume.prior_artifacts.contains_key("code"));
}

/// Verifies terminal runs refuse resume analysis.
#[test]
fn terminal_runs_are_not_resumable() {
    let (engine, _store, _bus) = engine_fixture();
    let run = spawn_run(&engine, WorkflowKind::Triage, TriggerOrigin::Api, "a", T0);
    engine
        .transition_run(&run.run_id, RunStatus::Cancelled, None, None, T0)
        .expect("cancel");
    let err = engine
        .analyze_resume_point(&run.run_id, &WorkerId::new("w"), T0)
        .expect_err("terminal");
    assert!(matches!(err, EngineError::NotResumable(RunStatus::Cancelled)));
}
