// crates/patchflow-core/src/engine/mod.rs
// ============================================================================
// Module: Patchflow Run State Engine
// Description: Persist runs and steps, enforce transitions, checkpoint, and
//              analyze resume points.
// Purpose: Provide the single canonical mutation path for run lifecycle
//          state.
// Dependencies: crate::{core, interfaces, ledger, store}
// ============================================================================

//! ## Overview
//! The run state engine is the only component that writes run, step, and
//! checkpoint documents. Every mutation validates the transition tables,
//! appends an audit event, and publishes the corresponding bus event. All
//! surfaces (HTTP, CLI, orchestrator) call into these methods so lifecycle
//! invariants hold no matter which surface drives a run.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::core::AuditEventKind;
use crate::core::Checkpoint;
use crate::core::CoreError;
use crate::core::ErrorRecord;
use crate::core::HashDigest;
use crate::core::HashError;
use crate::core::InvalidRunStatusTransition;
use crate::core::InvalidStepStatusTransition;
use crate::core::ModelTier;
use crate::core::Run;
use crate::core::RunId;
use crate::core::RunLock;
use crate::core::RunStatus;
use crate::core::StageKind;
use crate::core::Step;
use crate::core::StepArtifact;
use crate::core::StepId;
use crate::core::StepStatus;
use crate::core::TargetDescriptor;
use crate::core::TenantId;
use crate::core::Timestamp;
use crate::core::TriggerOrigin;
use crate::core::WorkerId;
use crate::core::WorkflowKind;
use crate::core::hash_canonical_json;
use crate::core::validate_run_transition;
use crate::core::validate_step_transition;
use crate::interfaces::BusError;
use crate::interfaces::BusEvent;
use crate::interfaces::Collection;
use crate::interfaces::DocumentQuery;
use crate::interfaces::DocumentStore;
use crate::interfaces::EventBus;
use crate::interfaces::Precondition;
use crate::interfaces::StoreError;
use crate::interfaces::Transaction;
use crate::interfaces::WriteOp;
use crate::ledger;
use crate::ledger::LedgerError;
use crate::store::decode_document;
use crate::store::encode_document;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Engine tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Window within which duplicate input fingerprints are rejected for
    /// triggers that demand dedup.
    pub dedup_window_millis: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dedup_window_millis: 10_000,
        }
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Run state engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Run not found.
    #[error("run not found: {0}")]
    RunNotFound(String),
    /// Step not found.
    #[error("step not found: {0}")]
    StepNotFound(String),
    /// A run with the same input fingerprint exists inside the dedup
    /// window.
    #[error("duplicate run fingerprint, existing run: {existing}")]
    DuplicateFingerprint {
        /// Run already covering the fingerprint.
        existing: RunId,
    },
    /// Steps may only be appended to running runs.
    #[error("run is not running: {0:?}")]
    RunNotRunning(RunStatus),
    /// Illegal run status transition.
    #[error(transparent)]
    InvalidRunTransition(#[from] InvalidRunStatusTransition),
    /// Illegal step status transition.
    #[error(transparent)]
    InvalidStepTransition(#[from] InvalidStepStatusTransition),
    /// Resume requested for a terminal run.
    #[error("run is terminal and cannot resume: {0:?}")]
    NotResumable(RunStatus),
    /// Another worker holds a live lock on the run.
    #[error("run lock held by {0}")]
    LockHeld(String),
    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Ledger failure.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// Canonical hashing failure.
    #[error(transparent)]
    Hash(#[from] HashError),
    /// Bus publish failure.
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl EngineError {
    /// Converts the engine error into the cross-boundary taxonomy.
    #[must_use]
    pub fn to_core_error(&self) -> CoreError {
        match self {
            Self::RunNotFound(id) => {
                CoreError::validation("run_not_found", format!("run not found: {id}"))
            }
            Self::StepNotFound(id) => {
                CoreError::validation("step_not_found", format!("step not found: {id}"))
            }
            Self::DuplicateFingerprint {
                existing,
            } => CoreError::validation("duplicate_fingerprint", "duplicate run input")
                .with_context("existing_run", existing.as_str()),
            Self::RunNotRunning(status) => CoreError::validation(
                "run_not_running",
                format!("run is not running: {}", status.as_str()),
            ),
            Self::InvalidRunTransition(err) => {
                CoreError::validation("invalid_run_transition", err.to_string())
            }
            Self::InvalidStepTransition(err) => {
                CoreError::validation("invalid_step_transition", err.to_string())
            }
            Self::NotResumable(status) => CoreError::validation(
                "run_not_resumable",
                format!("run is terminal: {}", status.as_str()),
            ),
            Self::LockHeld(holder) => {
                CoreError::lock_conflict(format!("run lock held by {holder}"))
            }
            Self::Store(err) => match err {
                StoreError::Conflict(detail) => CoreError::lock_conflict(detail.clone()),
                other => CoreError::internal(other.to_string()),
            },
            Self::Ledger(err) => CoreError::internal(err.to_string()),
            Self::Hash(err) => CoreError::internal(err.to_string()),
            Self::Bus(err) => CoreError::internal(err.to_string()),
        }
    }
}

// ============================================================================
// SECTION: Requests and Results
// ============================================================================

/// Parameters for creating a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRun {
    /// Tenant identifier.
    pub tenant_id: TenantId,
    /// Workflow kind to route.
    pub workflow: WorkflowKind,
    /// Trigger source.
    pub trigger: TriggerOrigin,
    /// External host target.
    pub target: TargetDescriptor,
    /// Canonical hash of the normalized trigger input.
    pub input_fingerprint: HashDigest,
}

/// Terminal outcome applied to a step.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StepOutcome {
    /// Output artifact for succeeded steps.
    pub output: Option<StepArtifact>,
    /// Failure record for failed steps.
    pub error: Option<ErrorRecord>,
    /// Model tier recorded when the step enters `running`.
    pub model_tier: Option<ModelTier>,
}

/// Resume analysis for a crashed or parked run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePoint {
    /// Ordinal the next worker should execute.
    pub resume_ordinal: u32,
    /// Artifacts accumulated by completed steps, keyed by stage label.
    pub prior_artifacts: std::collections::BTreeMap<String, StepArtifact>,
    /// Why the resume lands on this ordinal.
    pub reason: ResumeReason,
}

/// Why a resume analysis chose its ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeReason {
    /// The checkpointed step completed; the next ordinal is fresh.
    NextStep,
    /// A step at the resume ordinal was interrupted mid-flight.
    InterruptedStep,
}

// ============================================================================
// SECTION: Engine
// ============================================================================

/// Actor label the engine records on audit events it emits itself.
const ENGINE_ACTOR: &str = "engine";

/// Run state engine over injected storage and bus ports.
#[derive(Debug, Clone)]
pub struct RunStateEngine<S, B> {
    /// Document store port.
    store: S,
    /// Event bus port.
    bus: B,
    /// Engine tuning.
    config: EngineConfig,
}

impl<S, B> RunStateEngine<S, B>
where
    S: DocumentStore,
    B: EventBus,
{
    /// Creates a new engine.
    #[must_use]
    pub const fn new(store: S, bus: B, config: EngineConfig) -> Self {
        Self {
            store,
            bus,
            config,
        }
    }

    /// Returns the underlying store port.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Returns the underlying bus port.
    #[must_use]
    pub const fn bus(&self) -> &B {
        &self.bus
    }

    /// Creates a run in `pending` together with its initial checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DuplicateFingerprint`] when the trigger
    /// demands dedup and a run with the same fingerprint exists inside the
    /// dedup window, and [`EngineError`] on store or ledger failure.
    pub fn create_run(
        &self,
        request: CreateRun,
        now: Timestamp,
        rng: &mut dyn rand::RngCore,
    ) -> Result<Run, EngineError> {
        if request.trigger.demands_fingerprint_dedup() {
            let window_start = now.minus_millis(self.config.dedup_window_millis);
            let query = DocumentQuery::RunsByTenantStatus {
                tenant_id: request.tenant_id.clone(),
                status: None,
                created_from: Some(window_start),
                created_to: None,
            };
            let recent = self.store.query(Collection::Runs, &query, now)?;
            for document in &recent {
                let run: Run = decode_document(document)?;
                if run.input_fingerprint.matches(&request.input_fingerprint) {
                    return Err(EngineError::DuplicateFingerprint {
                        existing: run.run_id,
                    });
                }
            }
        }

        let run = Run {
            run_id: RunId::mint(now, rng),
            tenant_id: request.tenant_id,
            trigger: request.trigger,
            workflow: request.workflow,
            status: RunStatus::Pending,
            target: request.target,
            input_fingerprint: request.input_fingerprint,
            step_ids: Vec::new(),
            error: None,
            transition_reason: None,
            created_at: now,
            updated_at: now,
        };

        let checkpoint = Checkpoint::initial(run.run_id.clone(), now);
        let run_document =
            encode_document(run.run_id.as_str(), run.tenant_id.clone(), &run, None, 0)?;
        let checkpoint_document = encode_document(
            Checkpoint::document_id(&run.run_id),
            run.tenant_id.clone(),
            &checkpoint,
            None,
            0,
        )?;
        let transaction = Transaction::new()
            .require(Precondition::Absent {
                collection: Collection::Runs,
                id: run.run_id.as_str().to_string(),
            })
            .write(WriteOp::Put {
                collection: Collection::Runs,
                document: run_document,
            })
            .write(WriteOp::Put {
                collection: Collection::Checkpoints,
                document: checkpoint_document,
            });
        self.store.commit(transaction, now)?;

        ledger::append(
            &self.store,
            &self.bus,
            &run.tenant_id,
            Some(&run.run_id),
            ENGINE_ACTOR,
            AuditEventKind::RunCreated,
            hash_canonical_json(&run)?,
            now,
        )?;
        Ok(run)
    }

    /// Loads a run by id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RunNotFound`] when the run does not exist.
    pub fn get_run(&self, run_id: &RunId, now: Timestamp) -> Result<Run, EngineError> {
        let document = self
            .store
            .get(Collection::Runs, run_id.as_str(), now)?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        Ok(decode_document(&document)?)
    }

    /// Loads a step by id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::StepNotFound`] when the step does not exist.
    pub fn get_step(&self, step_id: &StepId, now: Timestamp) -> Result<Step, EngineError> {
        let document = self
            .store
            .get(Collection::Steps, step_id.as_str(), now)?
            .ok_or_else(|| EngineError::StepNotFound(step_id.to_string()))?;
        Ok(decode_document(&document)?)
    }

    /// Lists a run's steps in ordinal order.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] on store failure or corrupt documents.
    pub fn list_steps(&self, run_id: &RunId, now: Timestamp) -> Result<Vec<Step>, EngineError> {
        let query = DocumentQuery::StepsByRun {
            run_id: run_id.clone(),
        };
        let documents = self.store.query(Collection::Steps, &query, now)?;
        documents
            .iter()
            .map(decode_document)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Loads a run's latest checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RunNotFound`] when no checkpoint exists.
    pub fn latest_checkpoint(
        &self,
        run_id: &RunId,
        now: Timestamp,
    ) -> Result<Checkpoint, EngineError> {
        let document = self
            .store
            .get(Collection::Checkpoints, &Checkpoint::document_id(run_id), now)?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        Ok(decode_document(&document)?)
    }

    /// Appends the next step to a running run.
    ///
    /// Ordinals are dense: the new step always takes `run.step_ids.len()`.
    /// Step ids are deterministic per `(run, ordinal)` so a crashed append
    /// retried after resume lands on the same document.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RunNotRunning`] unless the run is `running`,
    /// and [`EngineError`] on store failure.
    pub fn append_step(
        &self,
        run_id: &RunId,
        stage: StageKind,
        input_hash: HashDigest,
        now: Timestamp,
    ) -> Result<Step, EngineError> {
        let run_document = self
            .store
            .get(Collection::Runs, run_id.as_str(), now)?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        let mut run: Run = decode_document(&run_document)?;
        if run.status != RunStatus::Running {
            return Err(EngineError::RunNotRunning(run.status));
        }

        let ordinal = u32::try_from(run.step_ids.len())
            .map_err(|_| StoreError::Store("step ordinal overflow".to_string()))?;
        let step = Step {
            step_id: StepId::for_ordinal(run_id, ordinal),
            run_id: run_id.clone(),
            ordinal,
            stage,
            status: StepStatus::Pending,
            input_hash,
            output: None,
            model_tier: None,
            started_at: None,
            ended_at: None,
            attempts: 0,
            error: None,
        };
        run.step_ids.push(step.step_id.clone());
        run.updated_at = now;

        let step_document =
            encode_document(step.step_id.as_str(), run.tenant_id.clone(), &step, None, 0)?;
        let updated_run =
            encode_document(run.run_id.as_str(), run.tenant_id.clone(), &run, None, 0)?;
        let transaction = Transaction::new()
            .require(Precondition::Version {
                collection: Collection::Runs,
                id: run.run_id.as_str().to_string(),
                expected: run_document.version,
            })
            .require(Precondition::Absent {
                collection: Collection::Steps,
                id: step.step_id.as_str().to_string(),
            })
            .write(WriteOp::Put {
                collection: Collection::Steps,
                document: step_document,
            })
            .write(WriteOp::Put {
                collection: Collection::Runs,
                document: updated_run,
            });
        self.store.commit(transaction, now)?;
        Ok(step)
    }

    /// Applies a validated status change to a step.
    ///
    /// Entering `running` stamps `started_at` and increments the attempt
    /// counter. Reaching `succeeded` also writes the run checkpoint in the
    /// same transaction. Terminal statuses publish `step.completed` and
    /// append an audit event.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidStepTransition`] on illegal edges and
    /// [`EngineError`] on store or ledger failure.
    pub fn update_step_status(
        &self,
        step_id: &StepId,
        new_status: StepStatus,
        outcome: StepOutcome,
        now: Timestamp,
    ) -> Result<Step, EngineError> {
        let step_document = self
            .store
            .get(Collection::Steps, step_id.as_str(), now)?
            .ok_or_else(|| EngineError::StepNotFound(step_id.to_string()))?;
        let mut step: Step = decode_document(&step_document)?;
        validate_step_transition(step.status, new_status)?;

        step.status = new_status;
        match new_status {
            StepStatus::Running => {
                step.attempts += 1;
                if step.started_at.is_none() {
                    step.started_at = Some(now);
                }
                step.model_tier = outcome.model_tier.or(step.model_tier);
                step.error = None;
            }
            StepStatus::Succeeded => {
                step.output = outcome.output;
                step.ended_at = Some(now);
            }
            StepStatus::FailedRetryable | StepStatus::FailedTerminal => {
                step.error = outcome.error;
                step.ended_at = Some(now);
            }
            StepStatus::Skipped => {
                step.ended_at = Some(now);
            }
            StepStatus::Pending => {}
        }

        let tenant_id = step_document.tenant_id.clone();
        let mut transaction = Transaction::new().require(Precondition::Version {
            collection: Collection::Steps,
            id: step.step_id.as_str().to_string(),
            expected: step_document.version,
        });
        let updated_step =
            encode_document(step.step_id.as_str(), tenant_id.clone(), &step, None, 0)?;
        transaction = transaction.write(WriteOp::Put {
            collection: Collection::Steps,
            document: updated_step,
        });

        if new_status == StepStatus::Succeeded {
            let mut checkpoint = self.latest_checkpoint(&step.run_id, now)?;
            checkpoint.last_completed_ordinal = Some(step.ordinal);
            if let Some(artifact) = &step.output {
                checkpoint.artifacts.insert(step.stage.as_str().to_string(), artifact.clone());
            }
            checkpoint.written_at = now;
            let checkpoint_document = encode_document(
                Checkpoint::document_id(&step.run_id),
                tenant_id.clone(),
                &checkpoint,
                None,
                0,
            )?;
            transaction = transaction.write(WriteOp::Put {
                collection: Collection::Checkpoints,
                document: checkpoint_document,
            });
        }

        self.store.commit(transaction, now)?;

        if new_status.is_terminal() {
            self.bus.publish(&BusEvent::StepCompleted {
                run_id: step.run_id.clone(),
                step_id: step.step_id.clone(),
                status: new_status,
            })?;
            ledger::append(
                &self.store,
                &self.bus,
                &tenant_id,
                Some(&step.run_id),
                ENGINE_ACTOR,
                AuditEventKind::StepCompleted,
                hash_canonical_json(&step)?,
                now,
            )?;
        }
        Ok(step)
    }

    /// Applies a validated status change to a run.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidRunTransition`] on illegal edges,
    /// including self-transitions, and [`EngineError`] on store or ledger
    /// failure.
    pub fn transition_run(
        &self,
        run_id: &RunId,
        new_status: RunStatus,
        reason: Option<String>,
        error: Option<ErrorRecord>,
        now: Timestamp,
    ) -> Result<Run, EngineError> {
        let run_document = self
            .store
            .get(Collection::Runs, run_id.as_str(), now)?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        let mut run: Run = decode_document(&run_document)?;
        let previous = run.status;
        validate_run_transition(previous, new_status)?;

        run.status = new_status;
        run.transition_reason = reason;
        if error.is_some() {
            run.error = error;
        }
        run.updated_at = now;

        let updated_run =
            encode_document(run.run_id.as_str(), run.tenant_id.clone(), &run, None, 0)?;
        let transaction = Transaction::new()
            .require(Precondition::Version {
                collection: Collection::Runs,
                id: run.run_id.as_str().to_string(),
                expected: run_document.version,
            })
            .write(WriteOp::Put {
                collection: Collection::Runs,
                document: updated_run,
            });
        self.store.commit(transaction, now)?;

        self.bus.publish(&BusEvent::RunStateChanged {
            tenant_id: run.tenant_id.clone(),
            run_id: run.run_id.clone(),
            from: previous,
            to: new_status,
        })?;
        ledger::append(
            &self.store,
            &self.bus,
            &run.tenant_id,
            Some(&run.run_id),
            ENGINE_ACTOR,
            AuditEventKind::RunTransitioned,
            hash_canonical_json(&run)?,
            now,
        )?;
        Ok(run)
    }

    /// Rewrites a run's checkpoint snapshot.
    ///
    /// Used by the approval gate, which must checkpoint after every
    /// decision.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] on store failure.
    pub fn record_checkpoint(
        &self,
        tenant_id: &TenantId,
        checkpoint: &Checkpoint,
        now: Timestamp,
    ) -> Result<(), EngineError> {
        let document = encode_document(
            Checkpoint::document_id(&checkpoint.run_id),
            tenant_id.clone(),
            checkpoint,
            None,
            0,
        )?;
        let transaction = Transaction::new().write(WriteOp::Put {
            collection: Collection::Checkpoints,
            document,
        });
        self.store.commit(transaction, now)?;
        Ok(())
    }

    /// Computes where a crashed or parked run should resume.
    ///
    /// Resume is legal only when the run status is non-terminal and no live
    /// lock is held by a different worker.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotResumable`] for terminal runs and
    /// [`EngineError::LockHeld`] when another worker holds a live lock.
    pub fn analyze_resume_point(
        &self,
        run_id: &RunId,
        requesting_worker: &WorkerId,
        now: Timestamp,
    ) -> Result<ResumePoint, EngineError> {
        let run = self.get_run(run_id, now)?;
        if run.status.is_terminal() {
            return Err(EngineError::NotResumable(run.status));
        }

        let lock_document =
            self.store.get(Collection::RunLocks, &RunLock::document_id(run_id), now)?;
        if let Some(document) = lock_document {
            let lock: RunLock = decode_document(&document)?;
            if !lock.lapsed(now) && lock.holder != *requesting_worker {
                return Err(EngineError::LockHeld(lock.holder.to_string()));
            }
        }

        let checkpoint = self.latest_checkpoint(run_id, now)?;
        let resume_ordinal = checkpoint.next_ordinal();
        let steps = self.list_steps(run_id, now)?;
        let interrupted = steps.iter().any(|step| {
            step.ordinal == resume_ordinal && step.status == StepStatus::Running
        });

        Ok(ResumePoint {
            resume_ordinal,
            prior_artifacts: checkpoint.artifacts,
            reason: if interrupted {
                ResumeReason::InterruptedStep
            } else {
                ResumeReason::NextStep
            },
        })
    }
}
