// crates/patchflow-core/src/core/idempotency.rs
// ============================================================================
// Module: Patchflow Idempotency Records
// Description: Idempotency record model, key schemes, and TTL policy.
// Purpose: Guarantee each inbound event is processed exactly once.
// Dependencies: crate::core::{hashing, identifiers, run, time}, serde
// ============================================================================

//! ## Overview
//! Inbound events carry source-scoped composite keys: webhook deliveries use
//! `{source}:{deliveryId}`, API mutations `{clientId}:{requestId}`, and
//! scheduled events `{scheduleId}:{executionTimeISO}`. Records are tenant
//! scoped internally, so collisions across tenants are impossible. The
//! check-and-set protocol over these records lives in
//! [`crate::idempotency`]; this module defines the persisted shapes.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

use crate::core::hashing::HashDigest;
use crate::core::identifiers::TenantId;
use crate::core::run::TriggerOrigin;
use crate::core::time::MILLIS_PER_HOUR;
use crate::core::time::MILLIS_PER_MINUTE;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: TTL Policy
// ============================================================================

/// Retention for completed records (24 hours).
pub const COMPLETED_TTL_MILLIS: i64 = 24 * MILLIS_PER_HOUR;

/// Retention for failed records (1 hour).
pub const FAILED_TTL_MILLIS: i64 = MILLIS_PER_HOUR;

/// Processing lock duration (5 minutes).
pub const PROCESSING_LOCK_TTL_MILLIS: i64 = 5 * MILLIS_PER_MINUTE;

/// Default cap on handler takeover attempts for one key.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

// ============================================================================
// SECTION: Key Schemes
// ============================================================================

/// Builds the composite key for a webhook delivery.
#[must_use]
pub fn webhook_key(source: &str, delivery_id: &str) -> String {
    format!("{source}:{delivery_id}")
}

/// Builds the composite key for an API mutation.
#[must_use]
pub fn api_key(client_id: &str, request_id: &str) -> String {
    format!("{client_id}:{request_id}")
}

/// Builds the composite key for a scheduled execution.
#[must_use]
pub fn schedule_key(schedule_id: &str, execution_time_iso: &str) -> String {
    format!("{schedule_id}:{execution_time_iso}")
}

// ============================================================================
// SECTION: Record Status
// ============================================================================

/// Idempotency record lifecycle status.
///
/// # Invariants
/// - Variants are stable for serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    /// A handler holds the processing lock.
    Processing,
    /// The handler completed; the cached response replays to duplicates.
    Completed,
    /// The handler failed; the record expires on the failed TTL.
    Failed,
}

// ============================================================================
// SECTION: Cached Response
// ============================================================================

/// Response payload replayed byte-identically to duplicate requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// HTTP-equivalent status code of the original response.
    pub status_code: u16,
    /// Exact response body bytes, stored as a UTF-8 string.
    pub body: String,
}

// ============================================================================
// SECTION: Idempotency Record
// ============================================================================

/// Persisted idempotency record for one inbound event key.
///
/// # Invariants
/// - `(tenant_id, key)` is unique within the record's TTL.
/// - Mutations happen only under check-and-set in a store transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Source-scoped composite key.
    pub key: String,
    /// Trigger source the key is scoped to.
    pub source: TriggerOrigin,
    /// Tenant identifier.
    pub tenant_id: TenantId,
    /// Canonical hash of the request payload.
    pub request_hash: HashDigest,
    /// Lifecycle status.
    pub status: IdempotencyStatus,
    /// Cached response for completed records.
    pub response: Option<CachedResponse>,
    /// Creation timestamp.
    pub created_at: Timestamp,
    /// Last update timestamp.
    pub updated_at: Timestamp,
    /// Record expiry honored by the store's TTL policy.
    pub expires_at: Option<Timestamp>,
    /// Processing lock expiry.
    pub lock_expires_at: Timestamp,
    /// Number of handler attempts, including takeovers.
    pub attempts: u32,
}

impl IdempotencyRecord {
    /// Returns the document id for a tenant-scoped key.
    #[must_use]
    pub fn document_id(tenant_id: &TenantId, key: &str) -> String {
        format!("idem-{}-{key}", tenant_id.as_str())
    }

    /// Returns true when the processing lock has lapsed at `now`.
    ///
    /// A lock expiring exactly at `now` is eligible for takeover.
    #[must_use]
    pub fn lock_lapsed(&self, now: Timestamp) -> bool {
        !now.is_before(self.lock_expires_at)
    }
}
