// crates/patchflow-core/src/core/approval.rs
// ============================================================================
// Module: Patchflow Approval Model
// Description: Capabilities, approval records, and signed decision payloads.
// Purpose: Bind human authorization to the exact bytes being applied.
// Dependencies: crate::core::{hashing, identifiers, run, time}, serde
// ============================================================================

//! ## Overview
//! An approval record authorizes one specific proposed mutation against an
//! external host. The record's `artifact_hash` is the SHA-256 of the exact
//! mutation payload; any change to the payload invalidates the approval.
//! Decisions are Ed25519 signatures over the canonical JSON bytes of
//! [`DecisionPayload`]. Approval status is monotonic: `pending` moves to
//! exactly one of `approved`, `rejected`, or `expired` and never moves again.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::core::hashing::HashDigest;
use crate::core::identifiers::ApprovalId;
use crate::core::identifiers::ApproverId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::TenantId;
use crate::core::run::TargetDescriptor;
use crate::core::time::MILLIS_PER_HOUR;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Capability Set
// ============================================================================

/// Outbound host operations the connector can perform.
///
/// # Invariants
/// - The set is closed; adding a capability is a model change, not a
///   subclass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Post a comment on an issue or PR.
    Comment,
    /// Create a branch.
    CreateBranch,
    /// Push a commit.
    PushCommit,
    /// Open a pull request.
    OpenPr,
    /// Update an existing pull request.
    UpdatePr,
    /// Merge a pull request.
    Merge,
}

impl Capability {
    /// Returns true when the capability mutates host state destructively
    /// and therefore requires an approval record.
    #[must_use]
    pub const fn is_destructive(self) -> bool {
        !matches!(self, Self::Comment)
    }

    /// Returns the stable snake_case label for the capability.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Comment => "comment",
            Self::CreateBranch => "create_branch",
            Self::PushCommit => "push_commit",
            Self::OpenPr => "open_pr",
            Self::UpdatePr => "update_pr",
            Self::Merge => "merge",
        }
    }
}

// ============================================================================
// SECTION: Approval Status
// ============================================================================

/// Approval record lifecycle status.
///
/// # Invariants
/// - Status is monotonic; `pending` is the only non-terminal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Awaiting a decision.
    Pending,
    /// Approved; the bound mutation may dispatch.
    Approved,
    /// Rejected by an approver.
    Rejected,
    /// Lapsed without a decision.
    Expired,
}

/// Validates that an approval status change is monotonic.
///
/// # Errors
///
/// Returns [`ApprovalStatusViolation`] when `from` is not `pending`.
pub fn validate_approval_transition(
    from: ApprovalStatus,
    to: ApprovalStatus,
) -> Result<(), ApprovalStatusViolation> {
    if from == ApprovalStatus::Pending && to != ApprovalStatus::Pending {
        Ok(())
    } else {
        Err(ApprovalStatusViolation {
            from,
            to,
        })
    }
}

/// Rejected approval status change.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("approval status is monotonic: {from:?} -> {to:?} is illegal")]
pub struct ApprovalStatusViolation {
    /// Status the record currently holds.
    pub from: ApprovalStatus,
    /// Status the caller attempted to persist.
    pub to: ApprovalStatus,
}

// ============================================================================
// SECTION: Decisions
// ============================================================================

/// Decision submitted by an approver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Authorize the bound mutation.
    Approve,
    /// Refuse the bound mutation.
    Reject,
}

/// Canonical payload covered by the approver's signature.
///
/// # Invariants
/// - Signing bytes are the RFC 8785 canonical JSON of this struct; field
///   names are part of the signature contract and must not change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionPayload {
    /// Run being authorized.
    pub run_id: RunId,
    /// Capability being authorized.
    pub capability: Capability,
    /// Target the mutation applies to.
    pub target: TargetDescriptor,
    /// SHA-256 of the exact mutation payload bytes.
    pub artifact_hash: HashDigest,
    /// Approve or reject.
    pub decision: ApprovalDecision,
    /// Signing timestamp.
    pub signed_at: Timestamp,
}

/// Signed decision submitted to the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedDecision {
    /// Payload covered by the signature.
    pub payload: DecisionPayload,
    /// Approver identity the signature is attributed to.
    pub approver: ApproverId,
    /// Base64-encoded Ed25519 signature over the canonical payload bytes.
    pub signature: String,
    /// Optional human-readable reason.
    pub reason: Option<String>,
}

// ============================================================================
// SECTION: Approval Record
// ============================================================================

/// Default approval validity window (4 hours).
pub const DEFAULT_APPROVAL_TTL_MILLIS: i64 = 4 * MILLIS_PER_HOUR;

/// Persisted approval record.
///
/// # Invariants
/// - `artifact_hash` never changes after creation.
/// - Decision fields are set exactly once, together with the terminal
///   status.
/// - Records survive run completion for audit retention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    /// Approval identifier.
    pub approval_id: ApprovalId,
    /// Run the approval authorizes.
    pub run_id: RunId,
    /// Tenant identifier.
    pub tenant_id: TenantId,
    /// Capability being authorized.
    pub capability: Capability,
    /// Target the mutation applies to.
    pub target: TargetDescriptor,
    /// SHA-256 of the exact mutation payload bytes.
    pub artifact_hash: HashDigest,
    /// Lifecycle status.
    pub status: ApprovalStatus,
    /// Approver identity for decided records.
    pub approver: Option<ApproverId>,
    /// Decision for decided records.
    pub decision: Option<ApprovalDecision>,
    /// Optional human-readable reason.
    pub reason: Option<String>,
    /// Base64-encoded signature for decided records.
    pub signature: Option<String>,
    /// Request timestamp.
    pub requested_at: Timestamp,
    /// Signing timestamp for decided records.
    pub signed_at: Option<Timestamp>,
    /// Expiry timestamp; strictly-less comparison, `expires_at == now`
    /// is already expired.
    pub expires_at: Timestamp,
}

impl ApprovalRecord {
    /// Returns true when the record has lapsed at `now`.
    #[must_use]
    pub fn lapsed(&self, now: Timestamp) -> bool {
        !now.is_before(self.expires_at)
    }
}
