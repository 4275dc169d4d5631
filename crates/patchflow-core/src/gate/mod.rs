// crates/patchflow-core/src/gate/mod.rs
// ============================================================================
// Module: Patchflow Approval Gate
// Description: Signed, hash-bound authorization of destructive mutations.
// Purpose: Ensure no destructive outbound action happens without a matching,
//          unexpired, signed approval.
// Dependencies: crate::{core, engine, interfaces, ledger}, ed25519-dalek
// ============================================================================

//! ## Overview
//! The gate owns approval records end to end: it writes pending records
//! bound to the SHA-256 of the exact mutation bytes, validates signed
//! decisions (signature, hash, strict expiry, per-tenant authorization),
//! unblocks or fails the run, and guards the final dispatch so mutated
//! payload bytes can never ride an earlier approval. Every request,
//! decision, and rejection lands on the audit chain.

// ============================================================================
// SECTION: Imports
// ============================================================================

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::Signature;
use ed25519_dalek::Verifier;
use thiserror::Error;

use crate::core::ApprovalDecision;
use crate::core::ApprovalId;
use crate::core::ApprovalRecord;
use crate::core::ApprovalStatus;
use crate::core::ApprovalStatusViolation;
use crate::core::AuditEventKind;
use crate::core::CoreError;
use crate::core::ErrorKind;
use crate::core::ErrorRecord;
use crate::core::HashError;
use crate::core::Run;
use crate::core::RunId;
use crate::core::RunStatus;
use crate::core::SignedDecision;
use crate::core::Timestamp;
use crate::core::canonical_json_bytes;
use crate::core::hash_bytes;
use crate::core::hash_canonical_json;
use crate::core::validate_approval_transition;
use crate::engine::EngineError;
use crate::engine::RunStateEngine;
use crate::interfaces::ApproverKeyring;
use crate::interfaces::BusEvent;
use crate::interfaces::Collection;
use crate::interfaces::ConnectorError;
use crate::interfaces::DispatchReceipt;
use crate::interfaces::DocumentQuery;
use crate::interfaces::DocumentStore;
use crate::interfaces::EventBus;
use crate::interfaces::HostConnector;
use crate::interfaces::HostMutation;
use crate::interfaces::Precondition;
use crate::interfaces::StoreError;
use crate::interfaces::Transaction;
use crate::interfaces::WriteOp;
use crate::ledger;
use crate::ledger::LedgerError;
use crate::store::decode_document;
use crate::store::encode_document;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Stable rejection reasons for invalid decisions.
pub mod reject_reason {
    /// The signature does not verify under the approver's key.
    pub const SIGNATURE_INVALID: &str = "signature_invalid";
    /// No verification key is registered for the approver.
    pub const UNKNOWN_APPROVER: &str = "unknown_approver";
    /// The approver is not authorized for the capability on this tenant.
    pub const UNAUTHORIZED_APPROVER: &str = "unauthorized_approver";
    /// The decision's artifact hash does not match the pending record.
    pub const HASH_MISMATCH: &str = "hash_mismatch";
    /// The decision references a different run, capability, or target.
    pub const BINDING_MISMATCH: &str = "binding_mismatch";
    /// The pending approval lapsed before the decision arrived.
    pub const EXPIRED: &str = "expired";
}

/// Approval gate errors.
#[derive(Debug, Error)]
pub enum GateError {
    /// No pending approval exists for the run.
    #[error("no pending approval for run {0}")]
    NoPendingApproval(String),
    /// Approval record not found.
    #[error("approval not found: {0}")]
    ApprovalNotFound(String),
    /// Non-destructive capabilities never require approval records.
    #[error("capability {0} is not destructive and needs no approval")]
    NonDestructiveCapability(String),
    /// The decision failed a gate validation; the run stays parked.
    #[error("approval invalid: {reason}")]
    Invalid {
        /// Stable rejection reason from [`reject_reason`].
        reason: &'static str,
    },
    /// Approval status is monotonic.
    #[error(transparent)]
    StatusViolation(#[from] ApprovalStatusViolation),
    /// Engine failure while unblocking or failing the run.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Ledger failure.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// Canonical hashing failure.
    #[error(transparent)]
    Hash(#[from] HashError),
    /// Host connector failure during guarded dispatch.
    #[error(transparent)]
    Connector(#[from] ConnectorError),
}

impl GateError {
    /// Converts the gate error into the cross-boundary taxonomy.
    #[must_use]
    pub fn to_core_error(&self) -> CoreError {
        match self {
            Self::Invalid {
                reason,
            } => CoreError::approval_invalid(*reason),
            Self::NoPendingApproval(run) => {
                CoreError::validation("no_pending_approval", format!("no pending approval: {run}"))
            }
            Self::ApprovalNotFound(id) => {
                CoreError::validation("approval_not_found", format!("approval not found: {id}"))
            }
            Self::NonDestructiveCapability(capability) => CoreError::validation(
                "capability_not_destructive",
                format!("{capability} needs no approval"),
            ),
            Self::StatusViolation(err) => {
                CoreError::validation("approval_status_monotonic", err.to_string())
            }
            Self::Engine(err) => err.to_core_error(),
            Self::Connector(err) => match err {
                ConnectorError::Timeout => CoreError::timeout("host dispatch timed out"),
                ConnectorError::Unreachable(detail) => {
                    CoreError::transient("host_unreachable", detail.clone())
                }
                ConnectorError::Rejected(detail) => {
                    CoreError::permanent("host_rejected", detail.clone())
                }
            },
            Self::Store(err) => CoreError::internal(err.to_string()),
            Self::Ledger(err) => CoreError::internal(err.to_string()),
            Self::Hash(err) => CoreError::internal(err.to_string()),
        }
    }
}

// ============================================================================
// SECTION: Decision Outcome
// ============================================================================

/// Result of an accepted decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateOutcome {
    /// Approval record after the decision applied.
    pub record: ApprovalRecord,
    /// Run state after the gate unblocked or failed it.
    pub run: Run,
}

// ============================================================================
// SECTION: Approval Gate
// ============================================================================

/// Actor label the gate records on audit events.
const GATE_ACTOR: &str = "approval-gate";

/// Signed, hash-bound approval gate.
#[derive(Debug, Clone)]
pub struct ApprovalGate<S, B, K> {
    /// Run state engine used for run transitions and checkpoints.
    engine: RunStateEngine<S, B>,
    /// Approver key registry.
    keyring: K,
    /// Approval validity window in milliseconds.
    ttl_millis: i64,
}

impl<S, B, K> ApprovalGate<S, B, K>
where
    S: DocumentStore,
    B: EventBus,
    K: ApproverKeyring,
{
    /// Creates a gate over the shared engine.
    #[must_use]
    pub const fn new(engine: RunStateEngine<S, B>, keyring: K, ttl_millis: i64) -> Self {
        Self {
            engine,
            keyring,
            ttl_millis,
        }
    }

    /// Writes a pending approval bound to the exact mutation bytes.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::NonDestructiveCapability`] for capabilities that
    /// need no approval, and [`GateError`] on store or ledger failure.
    pub fn request_approval(
        &self,
        run: &Run,
        mutation: &HostMutation,
        now: Timestamp,
        rng: &mut dyn rand::RngCore,
    ) -> Result<ApprovalRecord, GateError> {
        if !mutation.capability.is_destructive() {
            return Err(GateError::NonDestructiveCapability(
                mutation.capability.as_str().to_string(),
            ));
        }

        let record = ApprovalRecord {
            approval_id: ApprovalId::mint(now, rng),
            run_id: run.run_id.clone(),
            tenant_id: run.tenant_id.clone(),
            capability: mutation.capability,
            target: mutation.target.clone(),
            artifact_hash: hash_bytes(&mutation.payload),
            status: ApprovalStatus::Pending,
            approver: None,
            decision: None,
            reason: None,
            signature: None,
            requested_at: now,
            signed_at: None,
            expires_at: now.plus_millis(self.ttl_millis),
        };

        let document = encode_document(
            record.approval_id.as_str(),
            record.tenant_id.clone(),
            &record,
            None,
            0,
        )?;
        let transaction = Transaction::new()
            .require(Precondition::Absent {
                collection: Collection::Approvals,
                id: record.approval_id.as_str().to_string(),
            })
            .write(WriteOp::Put {
                collection: Collection::Approvals,
                document,
            });
        self.engine.store().commit(transaction, now)?;

        self.engine.bus().publish(&BusEvent::ApprovalRequested {
            run_id: record.run_id.clone(),
            approval_id: record.approval_id.clone(),
            artifact_hash: record.artifact_hash.clone(),
        }).map_err(EngineError::Bus)?;
        ledger::append(
            self.engine.store(),
            self.engine.bus(),
            &record.tenant_id,
            Some(&record.run_id),
            GATE_ACTOR,
            AuditEventKind::ApprovalRequested,
            hash_canonical_json(&record)?,
            now,
        )?;
        Ok(record)
    }

    /// Loads the pending approval for a run.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::NoPendingApproval`] when none exists.
    pub fn pending_approval(
        &self,
        run_id: &RunId,
        now: Timestamp,
    ) -> Result<ApprovalRecord, GateError> {
        let query = DocumentQuery::ApprovalsByRun {
            run_id: run_id.clone(),
        };
        let documents = self.engine.store().query(Collection::Approvals, &query, now)?;
        for document in &documents {
            let record: ApprovalRecord = decode_document(document)?;
            if record.status == ApprovalStatus::Pending {
                return Ok(record);
            }
        }
        Err(GateError::NoPendingApproval(run_id.to_string()))
    }

    /// Validates and applies a signed decision.
    ///
    /// Validation order: signature, then binding (run, capability, target),
    /// then artifact hash, then strict expiry, then authorization. A failed
    /// validation leaves the record pending, appends a `gate_rejected`
    /// audit event, and returns [`GateError::Invalid`]; the run stays in
    /// `awaiting_approval`.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Invalid`] on validation failure and
    /// [`GateError`] on store, engine, or ledger failure.
    pub fn decide(
        &self,
        decision: &SignedDecision,
        now: Timestamp,
    ) -> Result<GateOutcome, GateError> {
        let record = self.pending_approval(&decision.payload.run_id, now)?;

        if let Err(reason) = self.validate_decision(&record, decision, now) {
            self.audit_rejection(&record, reason, now)?;
            return Err(GateError::Invalid {
                reason,
            });
        }

        validate_approval_transition(
            record.status,
            match decision.payload.decision {
                ApprovalDecision::Approve => ApprovalStatus::Approved,
                ApprovalDecision::Reject => ApprovalStatus::Rejected,
            },
        )?;

        let mut decided = record;
        decided.status = match decision.payload.decision {
            ApprovalDecision::Approve => ApprovalStatus::Approved,
            ApprovalDecision::Reject => ApprovalStatus::Rejected,
        };
        decided.approver = Some(decision.approver.clone());
        decided.decision = Some(decision.payload.decision);
        decided.reason.clone_from(&decision.reason);
        decided.signature = Some(decision.signature.clone());
        decided.signed_at = Some(decision.payload.signed_at);
        self.persist_record(&decided, now)?;

        let run = match decision.payload.decision {
            ApprovalDecision::Approve => self.engine.transition_run(
                &decided.run_id,
                RunStatus::Running,
                Some("approval granted".to_string()),
                None,
                now,
            )?,
            ApprovalDecision::Reject => self.engine.transition_run(
                &decided.run_id,
                RunStatus::Failed,
                Some("approval rejected".to_string()),
                Some(ErrorRecord {
                    kind: ErrorKind::PolicyDenied,
                    code: "approval_denied".to_string(),
                    message: "approver rejected the proposed mutation".to_string(),
                    retryable: false,
                    context: std::collections::BTreeMap::new(),
                }),
                now,
            )?,
        };

        // The engine checkpoints after every approval decision so resume
        // analysis reflects the decision point.
        let mut checkpoint = self.engine.latest_checkpoint(&decided.run_id, now)?;
        checkpoint.written_at = now;
        self.engine.record_checkpoint(&decided.tenant_id, &checkpoint, now)?;

        self.engine.bus().publish(&BusEvent::ApprovalDecided {
            run_id: decided.run_id.clone(),
            approval_id: decided.approval_id.clone(),
            approved: decided.status == ApprovalStatus::Approved,
        }).map_err(EngineError::Bus)?;
        ledger::append(
            self.engine.store(),
            self.engine.bus(),
            &decided.tenant_id,
            Some(&decided.run_id),
            decision.approver.as_str(),
            AuditEventKind::ApprovalDecided,
            hash_canonical_json(&decided)?,
            now,
        )?;

        Ok(GateOutcome {
            record: decided,
            run,
        })
    }

    /// Expires lapsed pending approvals for a tenant and fails their runs.
    ///
    /// Driven by a scheduled sweep; `expires_at == now` counts as expired.
    ///
    /// # Errors
    ///
    /// Returns [`GateError`] on store, engine, or ledger failure.
    pub fn sweep_expired(
        &self,
        tenant_id: &crate::core::TenantId,
        now: Timestamp,
    ) -> Result<Vec<ApprovalRecord>, GateError> {
        let query = DocumentQuery::RunsByTenantStatus {
            tenant_id: tenant_id.clone(),
            status: Some(RunStatus::AwaitingApproval),
            created_from: None,
            created_to: None,
        };
        let parked = self.engine.store().query(Collection::Runs, &query, now)?;

        let mut expired = Vec::new();
        for document in &parked {
            let run: Run = decode_document(document)?;
            let Ok(record) = self.pending_approval(&run.run_id, now) else {
                continue;
            };
            if !record.lapsed(now) {
                continue;
            }

            validate_approval_transition(record.status, ApprovalStatus::Expired)?;
            let mut lapsed = record;
            lapsed.status = ApprovalStatus::Expired;
            self.persist_record(&lapsed, now)?;

            self.engine.transition_run(
                &run.run_id,
                RunStatus::Failed,
                Some("approval expired".to_string()),
                Some(ErrorRecord {
                    kind: ErrorKind::PolicyDenied,
                    code: "approval_expired".to_string(),
                    message: "no decision arrived before the approval lapsed".to_string(),
                    retryable: false,
                    context: std::collections::BTreeMap::new(),
                }),
                now,
            )?;
            ledger::append(
                self.engine.store(),
                self.engine.bus(),
                tenant_id,
                Some(&lapsed.run_id),
                GATE_ACTOR,
                AuditEventKind::ApprovalExpired,
                hash_canonical_json(&lapsed)?,
                now,
            )?;
            expired.push(lapsed);
        }
        Ok(expired)
    }

    /// Dispatches a mutation through the connector under the hash-binding
    /// invariant.
    ///
    /// Non-destructive mutations dispatch directly. Destructive mutations
    /// require an approved, unexpired record whose `artifact_hash` equals
    /// the SHA-256 of the exact payload bytes; any mismatch is audited and
    /// refused.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Invalid`] when the binding check fails and
    /// [`GateError::Connector`] when the host dispatch fails.
    pub fn dispatch_guarded<C>(
        &self,
        connector: &C,
        run: &Run,
        mutation: &HostMutation,
        now: Timestamp,
    ) -> Result<DispatchReceipt, GateError>
    where
        C: HostConnector + ?Sized,
    {
        if mutation.capability.is_destructive() {
            let approval = self.approved_record(&run.run_id, now)?;
            let payload_hash = hash_bytes(&mutation.payload);
            if !payload_hash.matches(&approval.artifact_hash)
                || approval.capability != mutation.capability
                || approval.target != mutation.target
            {
                self.audit_rejection(&approval, reject_reason::HASH_MISMATCH, now)?;
                return Err(GateError::Invalid {
                    reason: reject_reason::HASH_MISMATCH,
                });
            }
            if approval.lapsed(now) {
                self.audit_rejection(&approval, reject_reason::EXPIRED, now)?;
                return Err(GateError::Invalid {
                    reason: reject_reason::EXPIRED,
                });
            }
        }

        let receipt = connector.dispatch(mutation)?;
        ledger::append(
            self.engine.store(),
            self.engine.bus(),
            &run.tenant_id,
            Some(&run.run_id),
            GATE_ACTOR,
            AuditEventKind::MutationDispatched,
            hash_bytes(&mutation.payload),
            now,
        )?;
        Ok(receipt)
    }

    /// Loads the approved record for a run.
    fn approved_record(
        &self,
        run_id: &RunId,
        now: Timestamp,
    ) -> Result<ApprovalRecord, GateError> {
        let query = DocumentQuery::ApprovalsByRun {
            run_id: run_id.clone(),
        };
        let documents = self.engine.store().query(Collection::Approvals, &query, now)?;
        for document in &documents {
            let record: ApprovalRecord = decode_document(document)?;
            if record.status == ApprovalStatus::Approved {
                return Ok(record);
            }
        }
        Err(GateError::NoPendingApproval(run_id.to_string()))
    }

    /// Runs the decision validations, returning the first failed reason.
    fn validate_decision(
        &self,
        record: &ApprovalRecord,
        decision: &SignedDecision,
        now: Timestamp,
    ) -> Result<(), &'static str> {
        let Some(key) =
            self.keyring.verification_key(&record.tenant_id, &decision.approver)
        else {
            return Err(reject_reason::UNKNOWN_APPROVER);
        };
        let signature_bytes = BASE64
            .decode(&decision.signature)
            .map_err(|_| reject_reason::SIGNATURE_INVALID)?;
        let signature = Signature::from_slice(&signature_bytes)
            .map_err(|_| reject_reason::SIGNATURE_INVALID)?;
        let message = canonical_json_bytes(&decision.payload)
            .map_err(|_| reject_reason::SIGNATURE_INVALID)?;
        key.verify(&message, &signature).map_err(|_| reject_reason::SIGNATURE_INVALID)?;

        if decision.payload.run_id != record.run_id
            || decision.payload.capability != record.capability
            || decision.payload.target != record.target
        {
            return Err(reject_reason::BINDING_MISMATCH);
        }
        if !decision.payload.artifact_hash.matches(&record.artifact_hash) {
            return Err(reject_reason::HASH_MISMATCH);
        }
        if record.lapsed(now) {
            return Err(reject_reason::EXPIRED);
        }
        if !self.keyring.is_authorized(&record.tenant_id, &decision.approver, record.capability)
        {
            return Err(reject_reason::UNAUTHORIZED_APPROVER);
        }
        Ok(())
    }

    /// Persists an approval record update under its version precondition.
    fn persist_record(&self, record: &ApprovalRecord, now: Timestamp) -> Result<(), GateError> {
        let existing = self
            .engine
            .store()
            .get(Collection::Approvals, record.approval_id.as_str(), now)?
            .ok_or_else(|| GateError::ApprovalNotFound(record.approval_id.to_string()))?;
        let document = encode_document(
            record.approval_id.as_str(),
            record.tenant_id.clone(),
            record,
            None,
            0,
        )?;
        let transaction = Transaction::new()
            .require(Precondition::Version {
                collection: Collection::Approvals,
                id: record.approval_id.as_str().to_string(),
                expected: existing.version,
            })
            .write(WriteOp::Put {
                collection: Collection::Approvals,
                document,
            });
        self.engine.store().commit(transaction, now)?;
        Ok(())
    }

    /// Appends a `gate_rejected` security audit event.
    fn audit_rejection(
        &self,
        record: &ApprovalRecord,
        reason: &'static str,
        now: Timestamp,
    ) -> Result<(), GateError> {
        let subject = serde_json::json!({
            "approval_id": record.approval_id.as_str(),
            "reason": reason,
        });
        ledger::append(
            self.engine.store(),
            self.engine.bus(),
            &record.tenant_id,
            Some(&record.run_id),
            GATE_ACTOR,
            AuditEventKind::GateRejected,
            hash_canonical_json(&subject)?,
            now,
        )?;
        Ok(())
    }
}
