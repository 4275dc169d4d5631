// crates/patchflow-core/src/core/run.rs
// ============================================================================
// Module: Patchflow Run Model
// Description: Run documents, status set, and the legal transition table.
// Purpose: Capture one end-to-end workflow execution with strict lifecycle.
// Dependencies: crate::core::{error, hashing, identifiers, time}, serde
// ============================================================================

//! ## Overview
//! A run is one end-to-end execution of a workflow against a repository
//! target. Runs are append-mostly: status transitions and step appends only;
//! prior steps are immutable. The transition table here is the single source
//! of truth for legality; any attempt to persist an edge outside it fails
//! with [`InvalidRunStatusTransition`] carrying the allowed set.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::core::error::ErrorRecord;
use crate::core::hashing::HashDigest;
use crate::core::identifiers::RunId;
use crate::core::identifiers::StepId;
use crate::core::identifiers::TenantId;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Trigger Origin
// ============================================================================

/// Source that triggered a run.
///
/// # Invariants
/// - Variants are stable for serialization and idempotency key scoping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOrigin {
    /// Host-delivered webhook event.
    Webhook,
    /// Direct HTTP API call.
    Api,
    /// Operator CLI invocation.
    Cli,
    /// Scheduled execution.
    Schedule,
}

impl TriggerOrigin {
    /// Returns the stable snake_case label for the origin.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Api => "api",
            Self::Cli => "cli",
            Self::Schedule => "schedule",
        }
    }

    /// Returns true when duplicate input fingerprints must be rejected
    /// within the dedup window for this origin.
    ///
    /// Hosts redeliver webhooks aggressively; operators re-running a CLI
    /// command expect a fresh run.
    #[must_use]
    pub const fn demands_fingerprint_dedup(self) -> bool {
        matches!(self, Self::Webhook)
    }
}

// ============================================================================
// SECTION: Workflow Kind
// ============================================================================

/// Workflow kinds routable through the pipeline.
///
/// # Invariants
/// - Variants are stable for serialization and registry lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowKind {
    /// Classify and label only.
    Triage,
    /// Classify then review a proposed change.
    Review,
    /// Classify, resolve conflicts, then review.
    Resolve,
    /// Full change pipeline from an issue to a reviewed patch.
    IssueToCode,
    /// Full pipeline ending in an approval-gated apply.
    Autopilot,
}

impl WorkflowKind {
    /// Returns the stable kebab-case label for the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Triage => "triage",
            Self::Review => "review",
            Self::Resolve => "resolve",
            Self::IssueToCode => "issue-to-code",
            Self::Autopilot => "autopilot",
        }
    }
}

// ============================================================================
// SECTION: Target Descriptor
// ============================================================================

/// External host target a run operates against.
///
/// # Invariants
/// - `repository` is the host-qualified `owner/name` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    /// Repository in `owner/name` form.
    pub repository: String,
    /// Pull request number when the run targets a PR.
    pub pr_number: Option<u64>,
    /// Issue number when the run targets an issue.
    pub issue_number: Option<u64>,
}

impl TargetDescriptor {
    /// Creates a repository-only target.
    #[must_use]
    pub fn repository(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            pr_number: None,
            issue_number: None,
        }
    }
}

// ============================================================================
// SECTION: Run Status
// ============================================================================

/// Run lifecycle status.
///
/// # Invariants
/// - Variants are stable for serialization and index queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created and not yet picked up by a worker.
    Pending,
    /// A worker is executing pipeline stages.
    Running,
    /// Parked on a pending approval decision.
    AwaitingApproval,
    /// Terminal: all stages succeeded.
    Completed,
    /// Terminal: a stage or gate failed.
    Failed,
    /// Terminal: cancelled by an operator.
    Cancelled,
}

impl RunStatus {
    /// Returns true for terminal statuses.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns the stable snake_case label for the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

// ============================================================================
// SECTION: Transition Table
// ============================================================================

/// Returns the exact set of statuses reachable from `from`.
///
/// Terminal statuses have no outgoing edges. Self-transitions are illegal
/// because they never appear in the table.
#[must_use]
pub const fn allowed_run_transitions(from: RunStatus) -> &'static [RunStatus] {
    match from {
        RunStatus::Pending => &[RunStatus::Running, RunStatus::Cancelled],
        RunStatus::Running => &[
            RunStatus::AwaitingApproval,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ],
        RunStatus::AwaitingApproval => {
            &[RunStatus::Running, RunStatus::Cancelled, RunStatus::Failed]
        }
        RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled => &[],
    }
}

/// Validates a run status transition against the table.
///
/// # Errors
///
/// Returns [`InvalidRunStatusTransition`] carrying the allowed set when the
/// edge is not in the table.
pub fn validate_run_transition(
    from: RunStatus,
    to: RunStatus,
) -> Result<(), InvalidRunStatusTransition> {
    let allowed = allowed_run_transitions(from);
    if allowed.contains(&to) {
        Ok(())
    } else {
        Err(InvalidRunStatusTransition {
            from,
            to,
            allowed: allowed.to_vec(),
        })
    }
}

/// Rejected run status transition.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("illegal run transition {from:?} -> {to:?}")]
pub struct InvalidRunStatusTransition {
    /// Status the run currently holds.
    pub from: RunStatus,
    /// Status the caller attempted to persist.
    pub to: RunStatus,
    /// Exact set of legal destination statuses.
    pub allowed: Vec<RunStatus>,
}

// ============================================================================
// SECTION: Run Document
// ============================================================================

/// One end-to-end workflow execution.
///
/// # Invariants
/// - `step_ids` is append-only and ordered by step ordinal.
/// - `status` only changes along [`allowed_run_transitions`] edges.
/// - `input_fingerprint` is the canonical hash of the normalized trigger
///   input and never changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    /// Run identifier.
    pub run_id: RunId,
    /// Tenant identifier.
    pub tenant_id: TenantId,
    /// Source that triggered the run.
    pub trigger: TriggerOrigin,
    /// Workflow kind routed through the pipeline.
    pub workflow: WorkflowKind,
    /// Current lifecycle status.
    pub status: RunStatus,
    /// External host target.
    pub target: TargetDescriptor,
    /// Canonical hash of the normalized trigger input.
    pub input_fingerprint: HashDigest,
    /// Ordered step references.
    pub step_ids: Vec<StepId>,
    /// Structured failure record for failed runs.
    pub error: Option<ErrorRecord>,
    /// Reason recorded on the most recent transition, if any.
    pub transition_reason: Option<String>,
    /// Creation timestamp.
    pub created_at: Timestamp,
    /// Last update timestamp.
    pub updated_at: Timestamp,
}
