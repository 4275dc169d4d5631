// crates/patchflow-core/src/pipeline/mod.rs
// ============================================================================
// Module: Patchflow Pipeline Orchestrator
// Description: Drive runs through their workflow stages under lock.
// Purpose: Execute stages, persist outputs, and enforce the apply gate.
// Dependencies: crate::{core, engine, gate, idempotency, interfaces,
//               reliability, store}
// ============================================================================

//! ## Overview
//! The orchestrator is the worker-side execution loop: it claims the run
//! lock, resumes from the latest checkpoint, executes each stage through
//! the model capability under retry and breaker guards, persists outputs
//! through the engine, and parks the run behind the approval gate before
//! any destructive apply. Cancellation is cooperative: the loop observes a
//! cancelled run at each heartbeat boundary, marks the in-flight step
//! skipped, and stops.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod stages;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use stages::CAPABILITY_OUTPUT_INVALID;
pub use stages::CodeOutput;
pub use stages::PlanOutput;
pub use stages::ProposedMutation;
pub use stages::ResolveOutput;
pub use stages::ReviewOutput;
pub use stages::ReviewVerdict;
pub use stages::StageInput;
pub use stages::StageOutput;
pub use stages::TriageOutput;
pub use stages::ends_in_apply_gate;
pub use stages::parse_stage_output;
pub use stages::run_stage;
pub use stages::select_model_tier;
pub use stages::stage_sequence;

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use rand::SeedableRng;
use rand::rngs::StdRng;
use thiserror::Error;

use crate::core::ApprovalRecord;
use crate::core::ApprovalStatus;
use crate::core::CoreError;
use crate::core::ErrorKind;
use crate::core::ErrorRecord;
use crate::core::HashError;
use crate::core::ModelTier;
use crate::core::Run;
use crate::core::RunId;
use crate::core::RunStatus;
use crate::core::StageKind;
use crate::core::Step;
use crate::core::StepArtifact;
use crate::core::StepStatus;
use crate::core::Timestamp;
use crate::core::WorkerId;
use crate::core::canonical_json_bytes;
use crate::core::hash_canonical_json;
use crate::engine::EngineError;
use crate::engine::RunStateEngine;
use crate::engine::StepOutcome;
use crate::gate::ApprovalGate;
use crate::gate::GateError;
use crate::idempotency::LockError;
use crate::idempotency::LockManager;
use crate::interfaces::ApproverKeyring;
use crate::interfaces::Clock;
use crate::interfaces::Collection;
use crate::interfaces::DocumentQuery;
use crate::interfaces::DocumentStore;
use crate::interfaces::EventBus;
use crate::interfaces::HostConnector;
use crate::interfaces::HostMutation;
use crate::interfaces::ModelCapability;
use crate::interfaces::Sleeper;
use crate::reliability::BreakerConfig;
use crate::reliability::BreakerRegistry;
use crate::reliability::CircuitBreaker;
use crate::reliability::InMemoryRateLimitStore;
use crate::reliability::RetryPolicy;
use crate::reliability::STANDARD;
use crate::reliability::SlidingWindowLimiter;
use crate::reliability::guarded_call;
use crate::store::decode_document;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Breaker name shared by all model capability callers.
pub const MODEL_BREAKER: &str = "capability.model";

/// Breaker name shared by all host connector callers.
pub const CONNECTOR_BREAKER: &str = "capability.connector";

/// Orchestrator tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrchestratorConfig {
    /// Model re-invocations allowed when output fails to parse.
    pub parse_budget: u32,
    /// Deadline handed to each model call, in milliseconds.
    pub model_deadline_millis: u64,
    /// Retry policy for model and connector calls.
    pub retry_policy: RetryPolicy,
    /// Breaker parameters for model and connector breakers.
    pub breaker: BreakerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            parse_budget: 2,
            model_deadline_millis: 120_000,
            retry_policy: STANDARD,
            breaker: BreakerConfig::default(),
        }
    }
}

// ============================================================================
// SECTION: Errors and Progress
// ============================================================================

/// Orchestrator errors.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Engine failure.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// Gate failure.
    #[error(transparent)]
    Gate(#[from] GateError),
    /// Lock failure.
    #[error(transparent)]
    Lock(#[from] LockError),
    /// Canonical hashing failure.
    #[error(transparent)]
    Hash(#[from] HashError),
    /// Unexpected internal failure.
    #[error("orchestrator internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Converts the orchestrator error into the cross-boundary taxonomy.
    #[must_use]
    pub fn to_core_error(&self) -> CoreError {
        match self {
            Self::Engine(err) => err.to_core_error(),
            Self::Gate(err) => err.to_core_error(),
            Self::Lock(err) => match err {
                LockError::Held {
                    holder,
                } => CoreError::lock_conflict(format!("run lock held by {holder}")),
                // A lost acquisition race is a conflict, not a bug.
                LockError::Store(crate::interfaces::StoreError::Conflict(detail)) => {
                    CoreError::lock_conflict(detail.clone())
                }
                other => CoreError::internal(other.to_string()),
            },
            Self::Hash(err) => CoreError::internal(err.to_string()),
            Self::Internal(detail) => CoreError::internal(detail.clone()),
        }
    }
}

/// Result of one orchestrator pass over a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunProgress {
    /// The run reached `completed`.
    Completed(Run),
    /// The run parked in `awaiting_approval`.
    AwaitingApproval(Run),
    /// The run was cancelled; the in-flight step was skipped.
    Cancelled(Run),
    /// A step failed retryably; a later pass should re-execute the run.
    RetryPending(Run),
    /// The run reached `failed`.
    Failed(Run),
    /// The run was already terminal before this pass.
    AlreadyTerminal(Run),
}

// ============================================================================
// SECTION: Orchestrator
// ============================================================================

/// Worker-side pipeline orchestrator.
pub struct Orchestrator<S, B, K> {
    /// Run state engine.
    engine: RunStateEngine<S, B>,
    /// Approval gate.
    gate: ApprovalGate<S, B, K>,
    /// Run lock manager.
    locks: LockManager<S>,
    /// Language-model capability port.
    model: Arc<dyn ModelCapability>,
    /// Host connector port.
    connector: Arc<dyn HostConnector>,
    /// Clock port.
    clock: Arc<dyn Clock>,
    /// Sleeper port for retry delays.
    sleeper: Arc<dyn Sleeper>,
    /// Shared model breaker.
    model_breaker: Arc<CircuitBreaker>,
    /// Shared connector breaker.
    connector_breaker: Arc<CircuitBreaker>,
    /// Worker identity for lock ownership.
    worker: WorkerId,
    /// Orchestrator tuning.
    config: OrchestratorConfig,
    /// Seeded id-minting randomness.
    rng: Mutex<StdRng>,
}

impl<S, B, K> Orchestrator<S, B, K>
where
    S: DocumentStore,
    B: EventBus,
    K: ApproverKeyring,
{
    /// Creates an orchestrator, registering its breakers by name.
    #[allow(
        clippy::too_many_arguments,
        reason = "The composition root injects every port explicitly."
    )]
    #[must_use]
    pub fn new(
        engine: RunStateEngine<S, B>,
        gate: ApprovalGate<S, B, K>,
        locks: LockManager<S>,
        model: Arc<dyn ModelCapability>,
        connector: Arc<dyn HostConnector>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        breakers: &BreakerRegistry,
        worker: WorkerId,
        config: OrchestratorConfig,
        rng_seed: u64,
    ) -> Self {
        Self {
            engine,
            gate,
            locks,
            model,
            connector,
            clock,
            sleeper,
            model_breaker: breakers.named(MODEL_BREAKER, config.breaker),
            connector_breaker: breakers.named(CONNECTOR_BREAKER, config.breaker),
            worker,
            config,
            rng: Mutex::new(StdRng::seed_from_u64(rng_seed)),
        }
    }

    /// Returns the worker identity driving this orchestrator.
    #[must_use]
    pub const fn worker(&self) -> &WorkerId {
        &self.worker
    }

    /// Executes one pass over a run: resume, run stages, park or finish.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] on lock conflicts and infrastructure
    /// failures. Stage failures are not errors; they surface as
    /// [`RunProgress`] values after being persisted.
    pub fn execute_run(&self, run_id: &RunId) -> Result<RunProgress, OrchestratorError> {
        let now = self.clock.now();
        let run = self.engine.get_run(run_id, now)?;
        if run.status.is_terminal() {
            return Ok(RunProgress::AlreadyTerminal(run));
        }
        if run.status == RunStatus::AwaitingApproval {
            return Ok(RunProgress::AwaitingApproval(run));
        }

        self.locks.acquire(run_id, &self.worker, &run.tenant_id, now)?;
        let result = self.execute_locked(run);
        let release_at = self.clock.now();
        self.locks.release(run_id, &self.worker, release_at)?;
        result
    }

    /// Runs the stage loop while holding the run lock.
    fn execute_locked(&self, run: Run) -> Result<RunProgress, OrchestratorError> {
        let mut now = self.clock.now();
        let mut run = run;
        if run.status == RunStatus::Pending {
            run = self.engine.transition_run(
                &run.run_id,
                RunStatus::Running,
                Some(format!("claimed by {}", self.worker)),
                None,
                now,
            )?;
        }

        let sequence = stage_sequence(run.workflow);
        let resume = self.engine.analyze_resume_point(&run.run_id, &self.worker, now)?;
        let mut artifacts = resume.prior_artifacts;
        let mut ordinal = resume.resume_ordinal;

        while (ordinal as usize) < sequence.len() {
            now = self.clock.now();

            // Heartbeat boundary: extend the lock and observe cancellation.
            self.locks.heartbeat(&run.run_id, &self.worker, &run.tenant_id, now)?;
            run = self.engine.get_run(&run.run_id, now)?;
            if run.status == RunStatus::Cancelled {
                self.skip_in_flight_step(&run, ordinal, now)?;
                return Ok(RunProgress::Cancelled(run));
            }

            let stage = sequence[ordinal as usize];
            let step = self.prepare_step(&run, stage, ordinal, &artifacts, now)?;
            if step.status == StepStatus::Succeeded {
                // A prior worker completed this ordinal; trust its record.
                if let Some(artifact) = &step.output {
                    artifacts.insert(stage.as_str().to_string(), artifact.clone());
                }
                ordinal += 1;
                continue;
            }

            let input = self.stage_input(&run, &artifacts);
            let tier = select_model_tier(stage, complexity_from(&artifacts));
            self.engine.update_step_status(
                &step.step_id,
                StepStatus::Running,
                StepOutcome {
                    model_tier: Some(tier),
                    ..StepOutcome::default()
                },
                now,
            )?;

            match self.invoke_stage(stage, tier, &input) {
                Ok(output) => {
                    let inline = serde_json::to_value(&output).map_err(|err| {
                        OrchestratorError::Internal(format!("artifact encode failed: {err}"))
                    })?;
                    let artifact = StepArtifact::inline(hash_canonical_json(&output)?, inline);
                    artifacts.insert(stage.as_str().to_string(), artifact.clone());
                    self.engine.update_step_status(
                        &step.step_id,
                        StepStatus::Succeeded,
                        StepOutcome {
                            output: Some(artifact),
                            ..StepOutcome::default()
                        },
                        self.clock.now(),
                    )?;
                    ordinal += 1;
                }
                Err(error) => {
                    return self.handle_stage_failure(run, &step, &error);
                }
            }
        }

        self.finish_run(run)
    }

    /// Finds or appends the step document for an ordinal and readies it for
    /// execution.
    ///
    /// A step left `running` by a crashed worker is first marked
    /// `failed_retryable` so the attempt counter reflects the interruption.
    fn prepare_step(
        &self,
        run: &Run,
        stage: StageKind,
        ordinal: u32,
        artifacts: &BTreeMap<String, StepArtifact>,
        now: Timestamp,
    ) -> Result<Step, OrchestratorError> {
        let existing = self
            .engine
            .list_steps(&run.run_id, now)?
            .into_iter()
            .find(|step| step.ordinal == ordinal);
        let Some(step) = existing else {
            let input = self.stage_input(run, artifacts);
            let input_hash = hash_canonical_json(&input)?;
            return Ok(self.engine.append_step(&run.run_id, stage, input_hash, now)?);
        };

        if step.status == StepStatus::Running {
            let interrupted = self.engine.update_step_status(
                &step.step_id,
                StepStatus::FailedRetryable,
                StepOutcome {
                    error: Some(ErrorRecord {
                        kind: ErrorKind::Transient,
                        code: "worker_interrupted".to_string(),
                        message: "step was interrupted by a worker crash".to_string(),
                        retryable: true,
                        context: BTreeMap::new(),
                    }),
                    ..StepOutcome::default()
                },
                now,
            )?;
            return Ok(interrupted);
        }
        Ok(step)
    }

    /// Builds the stage input snapshot from run state and prior artifacts.
    fn stage_input(&self, run: &Run, artifacts: &BTreeMap<String, StepArtifact>) -> StageInput {
        let prior = artifacts
            .iter()
            .filter_map(|(label, artifact)| {
                artifact.inline.clone().map(|value| (label.clone(), value))
            })
            .collect();
        StageInput {
            run_id: run.run_id.clone(),
            tenant_id: run.tenant_id.clone(),
            workflow: run.workflow,
            target: run.target.clone(),
            request: serde_json::json!({
                "trigger": run.trigger.as_str(),
                "fingerprint": run.input_fingerprint,
            }),
            prior,
        }
    }

    /// Invokes the model under guards, re-asking within the parse budget.
    fn invoke_stage(
        &self,
        stage: StageKind,
        tier: ModelTier,
        input: &StageInput,
    ) -> Result<StageOutput, CoreError> {
        let mut last_error = CoreError::internal("stage never invoked");
        let budget = self.config.parse_budget.max(1);
        for _ in 0..budget {
            let mut rng = self.lock_rng().map_err(|err| err.to_core_error())?;
            let outcome = guarded_call(
                None::<(&SlidingWindowLimiter<InMemoryRateLimitStore>, _, _)>,
                &self.config.retry_policy,
                &self.model_breaker,
                self.clock.as_ref(),
                self.sleeper.as_ref(),
                &mut *rng,
                |_attempt| {
                    run_stage(
                        self.model.as_ref(),
                        stage,
                        tier,
                        input,
                        self.config.model_deadline_millis,
                    )
                },
            );
            drop(rng);
            match outcome {
                Ok(output) => return Ok(output),
                Err(error) if error.code == CAPABILITY_OUTPUT_INVALID => {
                    last_error = error;
                }
                Err(error) => return Err(error),
            }
        }
        Err(last_error)
    }

    /// Persists a stage failure and maps it to run progress.
    ///
    /// Failures whose kind is inherently retryable (timeout, transient,
    /// lock conflict) leave the step `failed_retryable` even when the
    /// immediate error says not to retry now, as with an open breaker; a
    /// later pass retries once conditions clear.
    fn handle_stage_failure(
        &self,
        run: Run,
        step: &Step,
        error: &CoreError,
    ) -> Result<RunProgress, OrchestratorError> {
        let now = self.clock.now();
        let reschedulable = error.retryable || error.kind.default_retryable();
        if reschedulable {
            self.engine.update_step_status(
                &step.step_id,
                StepStatus::FailedRetryable,
                StepOutcome {
                    error: Some(ErrorRecord::from(error)),
                    ..StepOutcome::default()
                },
                now,
            )?;
            return Ok(RunProgress::RetryPending(run));
        }

        self.engine.update_step_status(
            &step.step_id,
            StepStatus::FailedTerminal,
            StepOutcome {
                error: Some(ErrorRecord::from(error)),
                ..StepOutcome::default()
            },
            now,
        )?;
        let failed = self.engine.transition_run(
            &run.run_id,
            RunStatus::Failed,
            Some(format!("stage {} failed", step.stage.as_str())),
            Some(ErrorRecord::from(error)),
            self.clock.now(),
        )?;
        Ok(RunProgress::Failed(failed))
    }

    /// Completes a run whose stages are all done, enforcing the apply gate.
    fn finish_run(&self, run: Run) -> Result<RunProgress, OrchestratorError> {
        let now = self.clock.now();
        // Cancellation may have landed during the final stage.
        let run = self.engine.get_run(&run.run_id, now)?;
        if run.status == RunStatus::Cancelled {
            return Ok(RunProgress::Cancelled(run));
        }
        if !ends_in_apply_gate(run.workflow) {
            let completed = self.engine.transition_run(
                &run.run_id,
                RunStatus::Completed,
                Some("all stages succeeded".to_string()),
                None,
                now,
            )?;
            return Ok(RunProgress::Completed(completed));
        }

        let checkpoint = self.engine.latest_checkpoint(&run.run_id, now)?;
        let Some(mutation) = proposed_mutation_from(&checkpoint.artifacts) else {
            // Nothing to apply; the pipeline concluded without a change.
            let completed = self.engine.transition_run(
                &run.run_id,
                RunStatus::Completed,
                Some("no mutation proposed".to_string()),
                None,
                now,
            )?;
            return Ok(RunProgress::Completed(completed));
        };
        let host_mutation = to_host_mutation(&run, &mutation)?;

        if let Some(approval) = self.latest_approval(&run, now)? {
            match approval.status {
                ApprovalStatus::Approved => return self.apply_approved(run, &host_mutation),
                ApprovalStatus::Pending => {
                    let parked = self.engine.get_run(&run.run_id, now)?;
                    return Ok(RunProgress::AwaitingApproval(parked));
                }
                ApprovalStatus::Rejected | ApprovalStatus::Expired => {
                    let failed = self.engine.get_run(&run.run_id, now)?;
                    return Ok(RunProgress::Failed(failed));
                }
            }
        }

        let mut rng = self.lock_rng()?;
        self.gate.request_approval(&run, &host_mutation, now, &mut *rng)?;
        drop(rng);
        let parked = self.engine.transition_run(
            &run.run_id,
            RunStatus::AwaitingApproval,
            Some("destructive mutation needs approval".to_string()),
            None,
            self.clock.now(),
        )?;
        Ok(RunProgress::AwaitingApproval(parked))
    }

    /// Dispatches an approved mutation and completes the run.
    fn apply_approved(
        &self,
        run: Run,
        mutation: &HostMutation,
    ) -> Result<RunProgress, OrchestratorError> {
        let mut rng = self.lock_rng()?;
        let dispatched = guarded_call(
            None::<(&SlidingWindowLimiter<InMemoryRateLimitStore>, _, _)>,
            &self.config.retry_policy,
            &self.connector_breaker,
            self.clock.as_ref(),
            self.sleeper.as_ref(),
            &mut *rng,
            |_attempt| {
                self.gate
                    .dispatch_guarded(
                        self.connector.as_ref(),
                        &run,
                        mutation,
                        self.clock.now(),
                    )
                    .map_err(|err| err.to_core_error())
            },
        );
        drop(rng);

        match dispatched {
            Ok(_receipt) => {
                let completed = self.engine.transition_run(
                    &run.run_id,
                    RunStatus::Completed,
                    Some("approved mutation applied".to_string()),
                    None,
                    self.clock.now(),
                )?;
                Ok(RunProgress::Completed(completed))
            }
            Err(error) if error.retryable || error.kind.default_retryable() => {
                Ok(RunProgress::RetryPending(run))
            }
            Err(error) => {
                let failed = self.engine.transition_run(
                    &run.run_id,
                    RunStatus::Failed,
                    Some("approved mutation could not be applied".to_string()),
                    Some(ErrorRecord::from(&error)),
                    self.clock.now(),
                )?;
                Ok(RunProgress::Failed(failed))
            }
        }
    }

    /// Loads the newest approval record for a run, if any.
    fn latest_approval(
        &self,
        run: &Run,
        now: Timestamp,
    ) -> Result<Option<ApprovalRecord>, OrchestratorError> {
        let query = DocumentQuery::ApprovalsByRun {
            run_id: run.run_id.clone(),
        };
        let documents = self
            .engine
            .store()
            .query(Collection::Approvals, &query, now)
            .map_err(EngineError::Store)?;
        let mut records = documents
            .iter()
            .map(decode_document::<ApprovalRecord>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(EngineError::Store)?;
        records.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        Ok(records.pop())
    }

    /// Marks the in-flight step of a cancelled run as skipped.
    fn skip_in_flight_step(
        &self,
        run: &Run,
        ordinal: u32,
        now: Timestamp,
    ) -> Result<(), OrchestratorError> {
        let steps = self.engine.list_steps(&run.run_id, now)?;
        if let Some(step) = steps.iter().find(|step| step.ordinal == ordinal) {
            if !step.status.is_terminal() {
                self.engine.update_step_status(
                    &step.step_id,
                    StepStatus::Skipped,
                    StepOutcome::default(),
                    now,
                )?;
            }
        }
        Ok(())
    }

    /// Locks the id-minting randomness.
    fn lock_rng(&self) -> Result<MutexGuard<'_, StdRng>, OrchestratorError> {
        self.rng
            .lock()
            .map_err(|_| OrchestratorError::Internal("rng mutex poisoned".to_string()))
    }
}

// ============================================================================
// SECTION: Helper Functions
// ============================================================================

/// Extracts the triage complexity score from accumulated artifacts.
fn complexity_from(artifacts: &BTreeMap<String, StepArtifact>) -> Option<u8> {
    let artifact = artifacts.get(StageKind::Triage.as_str())?;
    let inline = artifact.inline.as_ref()?;
    let score = inline.get("complexity_score")?.as_u64()?;
    u8::try_from(score).ok()
}

/// Extracts the freshest proposed mutation from accumulated artifacts.
///
/// Resolve output supersedes code output when both propose a mutation.
fn proposed_mutation_from(
    artifacts: &BTreeMap<String, StepArtifact>,
) -> Option<ProposedMutation> {
    for stage in [StageKind::Resolve, StageKind::Code] {
        let Some(inline) = artifacts.get(stage.as_str()).and_then(|a| a.inline.as_ref()) else {
            continue;
        };
        if let Ok(output) = serde_json::from_value::<StageOutput>(inline.clone()) {
            if let Some(mutation) = output.proposed_mutation() {
                return Some(mutation.clone());
            }
        }
    }
    None
}

/// Converts a proposed mutation into the canonical host mutation.
///
/// The payload bytes are the RFC 8785 canonical JSON of the proposal's
/// payload; the approval hash binds exactly these bytes.
fn to_host_mutation(run: &Run, mutation: &ProposedMutation) -> Result<HostMutation, HashError> {
    let payload = canonical_json_bytes(&mutation.payload)?;
    Ok(HostMutation {
        capability: mutation.capability,
        target: run.target.clone(),
        payload,
        content_type: mutation.content_type.clone(),
    })
}
