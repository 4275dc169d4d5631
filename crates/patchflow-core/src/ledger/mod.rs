// crates/patchflow-core/src/ledger/mod.rs
// ============================================================================
// Module: Patchflow Audit Ledger
// Description: Append and verify the per-tenant hash-chained audit log.
// Purpose: Make every consequential action tamper-evident.
// Dependencies: crate::core, crate::interfaces, crate::store
// ============================================================================

//! ## Overview
//! The ledger appends [`AuditEvent`] records to a per-tenant chain. Each
//! event's `prev_hash` is the SHA-256 of the prior event's canonical JSON
//! bytes; the first event links to a fixed genesis value. Appends are
//! linearized per tenant by deriving the event id from the chain sequence
//! and committing with an absence precondition, so two concurrent appends
//! for the same position cannot both succeed.

// ============================================================================
// SECTION: Imports
// ============================================================================

use thiserror::Error;

use crate::core::AuditEvent;
use crate::core::AuditEventKind;
use crate::core::EventId;
use crate::core::GENESIS_PREV_HASH;
use crate::core::HashDigest;
use crate::core::HashError;
use crate::core::RunId;
use crate::core::TenantId;
use crate::core::Timestamp;
use crate::core::hash_canonical_json;
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
use crate::store::decode_document;
use crate::store::encode_document;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Bounded retries when a concurrent append wins the chain position.
const APPEND_RETRIES: u32 = 3;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Ledger operation errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Canonical hashing failure.
    #[error(transparent)]
    Hash(#[from] HashError),
    /// Bus publish failure.
    #[error(transparent)]
    Bus(#[from] BusError),
    /// Concurrent appenders exhausted the retry budget.
    #[error("audit chain contention for tenant {0}")]
    Contention(String),
}

/// Chain verification failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("audit chain violated at seq {seq}: {reason}")]
pub struct ChainViolation {
    /// Sequence of the offending event.
    pub seq: u64,
    /// Stable violation reason.
    pub reason: String,
}

// ============================================================================
// SECTION: Chain Hashing
// ============================================================================

/// Computes the chain hash of an event over its canonical bytes.
///
/// # Errors
///
/// Returns [`HashError`] when canonicalization fails.
pub fn chain_hash(event: &AuditEvent) -> Result<String, HashError> {
    Ok(hash_canonical_json(event)?.value)
}

// ============================================================================
// SECTION: Append
// ============================================================================

/// Appends one event to a tenant's audit chain and publishes
/// `audit.appended`.
///
/// # Errors
///
/// Returns [`LedgerError`] when the store, hashing, or bus fails, or when
/// concurrent appenders exhaust the retry budget.
pub fn append<S, B>(
    store: &S,
    bus: &B,
    tenant_id: &TenantId,
    run_id: Option<&RunId>,
    actor: &str,
    kind: AuditEventKind,
    payload_hash: HashDigest,
    now: Timestamp,
) -> Result<AuditEvent, LedgerError>
where
    S: DocumentStore + ?Sized,
    B: EventBus + ?Sized,
{
    for _ in 0..APPEND_RETRIES {
        let head = chain_head(store, tenant_id, now)?;
        let (seq, prev_hash) = match &head {
            Some(last) => (last.seq + 1, chain_hash(last)?),
            None => (0, GENESIS_PREV_HASH.to_string()),
        };

        let event = AuditEvent {
            event_id: EventId::for_chain(tenant_id, seq),
            tenant_id: tenant_id.clone(),
            run_id: run_id.cloned(),
            actor: actor.to_string(),
            kind,
            payload_hash: payload_hash.clone(),
            prev_hash,
            seq,
            recorded_at: now,
        };

        let document = encode_document(
            event.event_id.as_str(),
            tenant_id.clone(),
            &event,
            None,
            0,
        )?;
        let transaction = Transaction::new()
            .require(Precondition::Absent {
                collection: Collection::AuditEvents,
                id: event.event_id.as_str().to_string(),
            })
            .write(WriteOp::Put {
                collection: Collection::AuditEvents,
                document,
            });

        match store.commit(transaction, now) {
            Ok(()) => {
                bus.publish(&BusEvent::AuditAppended {
                    tenant_id: tenant_id.clone(),
                    event_id: event.event_id.clone(),
                    seq,
                })?;
                return Ok(event);
            }
            Err(StoreError::Conflict(_)) => {}
            Err(err) => return Err(err.into()),
        }
    }
    Err(LedgerError::Contention(tenant_id.to_string()))
}

/// Loads the newest event of a tenant chain.
fn chain_head<S>(
    store: &S,
    tenant_id: &TenantId,
    now: Timestamp,
) -> Result<Option<AuditEvent>, LedgerError>
where
    S: DocumentStore + ?Sized,
{
    let query = DocumentQuery::AuditByTenant {
        tenant_id: tenant_id.clone(),
        recorded_from: None,
    };
    let documents = store.query(Collection::AuditEvents, &query, now)?;
    documents.last().map(decode_document).transpose().map_err(Into::into)
}

/// Loads a tenant's full chain in sequence order.
///
/// # Errors
///
/// Returns [`LedgerError`] when the store fails or a document is corrupt.
pub fn load_chain<S>(
    store: &S,
    tenant_id: &TenantId,
    now: Timestamp,
) -> Result<Vec<AuditEvent>, LedgerError>
where
    S: DocumentStore + ?Sized,
{
    let query = DocumentQuery::AuditByTenant {
        tenant_id: tenant_id.clone(),
        recorded_from: None,
    };
    let documents = store.query(Collection::AuditEvents, &query, now)?;
    documents.iter().map(decode_document).collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

// ============================================================================
// SECTION: Verification
// ============================================================================

/// Verifies linkage, hash correctness, and sequence density of a chain.
///
/// An empty chain is valid. Verification fails closed on the first
/// mismatch.
///
/// # Errors
///
/// Returns [`ChainViolation`] naming the offending sequence.
pub fn verify_chain(events: &[AuditEvent]) -> Result<(), ChainViolation> {
    let mut expected_prev = GENESIS_PREV_HASH.to_string();
    for (index, event) in events.iter().enumerate() {
        let expected_seq = index as u64;
        if event.seq != expected_seq {
            return Err(ChainViolation {
                seq: event.seq,
                reason: format!("sequence gap: expected {expected_seq}"),
            });
        }
        if event.prev_hash != expected_prev {
            return Err(ChainViolation {
                seq: event.seq,
                reason: "prev_hash does not match prior event".to_string(),
            });
        }
        expected_prev = chain_hash(event).map_err(|err| ChainViolation {
            seq: event.seq,
            reason: format!("canonicalization failed: {err}"),
        })?;
    }
    Ok(())
}
