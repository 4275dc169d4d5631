// crates/patchflow-core/src/core/audit.rs
// ============================================================================
// Module: Patchflow Audit Events
// Description: Append-only, hash-chained audit event records.
// Purpose: Provide a tamper-evident ledger of consequential actions.
// Dependencies: crate::core::{hashing, identifiers, time}, serde
// ============================================================================

//! ## Overview
//! Audit events form a per-tenant hash chain: every event's `prev_hash` is
//! the SHA-256 of the chronologically prior event's canonical JSON bytes,
//! with a fixed genesis value for the first event. Events are append-only
//! and never updated or deleted; chain verification lives in
//! [`crate::ledger`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

use crate::core::hashing::HashDigest;
use crate::core::identifiers::EventId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::TenantId;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Event Kinds
// ============================================================================

/// Consequential actions recorded on the audit chain.
///
/// # Invariants
/// - Variants are stable for serialization; removing one breaks historic
///   chain verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    /// A run was created.
    RunCreated,
    /// A run moved along a legal status edge.
    RunTransitioned,
    /// A step reached a terminal status.
    StepCompleted,
    /// An approval was requested for a proposed mutation.
    ApprovalRequested,
    /// An approver decision was accepted by the gate.
    ApprovalDecided,
    /// A pending approval lapsed.
    ApprovalExpired,
    /// The gate refused a decision or dispatch attempt.
    GateRejected,
    /// An approved mutation was dispatched to the host connector.
    MutationDispatched,
    /// A duplicate inbound event replayed a cached response.
    IdempotencyReplayed,
}

// ============================================================================
// SECTION: Audit Event
// ============================================================================

/// Genesis value for `prev_hash` on the first event of a tenant chain.
pub const GENESIS_PREV_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Append-only audit event.
///
/// # Invariants
/// - `seq` is dense and strictly increasing within a tenant.
/// - `prev_hash` equals the SHA-256 of the prior event's canonical bytes,
///   or [`GENESIS_PREV_HASH`] for `seq == 0`.
/// - Events are never updated or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event identifier, ordered within the tenant chain.
    pub event_id: EventId,
    /// Tenant owning the chain.
    pub tenant_id: TenantId,
    /// Run the event concerns, when applicable.
    pub run_id: Option<RunId>,
    /// Acting identity (worker, approver, or system surface).
    pub actor: String,
    /// Event kind.
    pub kind: AuditEventKind,
    /// Canonical hash of the event's subject payload.
    pub payload_hash: HashDigest,
    /// Hex SHA-256 of the prior event's canonical bytes.
    pub prev_hash: String,
    /// Dense per-tenant sequence number.
    pub seq: u64,
    /// Event timestamp.
    pub recorded_at: Timestamp,
}
