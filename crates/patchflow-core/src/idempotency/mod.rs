// crates/patchflow-core/src/idempotency/mod.rs
// ============================================================================
// Module: Patchflow Idempotency & Locking Runtime
// Description: Check-and-set processing of inbound events and run locks.
// Purpose: Process each inbound event exactly once and serialize run
//          mutations.
// Dependencies: crate::{core, interfaces, store}
// ============================================================================

//! ## Overview
//! [`IdempotencyGate::begin`] implements the check-and-set protocol inside a
//! single store transaction: exactly one caller per key executes the handler
//! body; duplicates replay the cached response byte-identically; lapsed
//! processing locks are taken over up to the attempt cap. [`LockManager`]
//! provides the exclusive run lock with heartbeat extension and
//! takeover-after-expiry. Both rely on version preconditions, so every
//! mutation is atomic against concurrent workers.

// ============================================================================
// SECTION: Imports
// ============================================================================

use thiserror::Error;

use crate::core::CachedResponse;
use crate::core::COMPLETED_TTL_MILLIS;
use crate::core::DEFAULT_MAX_ATTEMPTS;
use crate::core::DEFAULT_RUN_LOCK_TTL_MILLIS;
use crate::core::FAILED_TTL_MILLIS;
use crate::core::HashDigest;
use crate::core::IdempotencyRecord;
use crate::core::IdempotencyStatus;
use crate::core::PROCESSING_LOCK_TTL_MILLIS;
use crate::core::RunId;
use crate::core::RunLock;
use crate::core::TenantId;
use crate::core::Timestamp;
use crate::core::TriggerOrigin;
use crate::core::WorkerId;
use crate::interfaces::Collection;
use crate::interfaces::DocumentStore;
use crate::interfaces::Precondition;
use crate::interfaces::StoreError;
use crate::interfaces::Transaction;
use crate::interfaces::WriteOp;
use crate::store::decode_document;
use crate::store::encode_document;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Bounded retries when concurrent callers race a check-and-set.
const CAS_RETRIES: u32 = 3;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Idempotency gate errors.
#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Concurrent callers exhausted the check-and-set retry budget.
    #[error("idempotency contention for key {0}")]
    Contention(String),
    /// No record exists for a finalize call.
    #[error("idempotency record not found: {0}")]
    RecordNotFound(String),
}

/// Run lock errors.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another worker holds a live lock.
    #[error("run lock held by {holder}")]
    Held {
        /// Current live holder.
        holder: WorkerId,
    },
    /// The caller does not hold the lock.
    #[error("run lock not held by caller")]
    NotHolder,
    /// The caller's lock lapsed before the operation.
    #[error("run lock expired")]
    Expired,
    /// No lock exists for the run.
    #[error("run lock not found: {0}")]
    NotFound(String),
    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ============================================================================
// SECTION: Begin Outcome
// ============================================================================

/// Outcome of the check-and-set protocol for one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    /// The caller owns the key and must execute the handler body.
    New {
        /// Freshly written processing record.
        record: IdempotencyRecord,
    },
    /// A completed record exists; replay the cached response.
    Duplicate {
        /// Response to replay byte-identically.
        response: CachedResponse,
    },
    /// Another handler holds a live processing lock.
    InProgress,
    /// The attempt cap is reached or the record is terminally failed.
    Exhausted,
}

// ============================================================================
// SECTION: Idempotency Gate
// ============================================================================

/// Tuning for the idempotency gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdempotencyConfig {
    /// Cap on handler attempts, including takeovers.
    pub max_attempts: u32,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Check-and-set gate over idempotency records.
#[derive(Debug, Clone)]
pub struct IdempotencyGate<S> {
    /// Document store port.
    store: S,
    /// Gate tuning.
    config: IdempotencyConfig,
}

impl<S> IdempotencyGate<S>
where
    S: DocumentStore,
{
    /// Creates a new gate.
    #[must_use]
    pub const fn new(store: S, config: IdempotencyConfig) -> Self {
        Self {
            store,
            config,
        }
    }

    /// Runs the check-and-set protocol for one inbound event key.
    ///
    /// Exactly one of the five protocol arms applies atomically:
    /// no record inserts a processing record and returns `New`; a completed
    /// record returns `Duplicate` with the cached response; a live
    /// processing lock returns `InProgress`; a lapsed lock under the
    /// attempt cap is taken over and returns `New`; everything else is
    /// `Exhausted`.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError`] on store failure or when concurrent
    /// callers exhaust the retry budget.
    pub fn begin(
        &self,
        tenant_id: &TenantId,
        source: TriggerOrigin,
        key: &str,
        request_hash: HashDigest,
        now: Timestamp,
    ) -> Result<BeginOutcome, IdempotencyError> {
        let document_id = IdempotencyRecord::document_id(tenant_id, key);
        for _ in 0..CAS_RETRIES {
            let existing = self.store.get(Collection::Idempotency, &document_id, now)?;
            let Some(document) = existing else {
                let record = IdempotencyRecord {
                    key: key.to_string(),
                    source,
                    tenant_id: tenant_id.clone(),
                    request_hash: request_hash.clone(),
                    status: IdempotencyStatus::Processing,
                    response: None,
                    created_at: now,
                    updated_at: now,
                    expires_at: None,
                    lock_expires_at: now.plus_millis(PROCESSING_LOCK_TTL_MILLIS),
                    attempts: 1,
                };
                let insert = encode_document(
                    document_id.clone(),
                    tenant_id.clone(),
                    &record,
                    None,
                    0,
                )?;
                let transaction = Transaction::new()
                    .require(Precondition::Absent {
                        collection: Collection::Idempotency,
                        id: document_id.clone(),
                    })
                    .write(WriteOp::Put {
                        collection: Collection::Idempotency,
                        document: insert,
                    });
                match self.store.commit(transaction, now) {
                    Ok(()) => {
                        return Ok(BeginOutcome::New {
                            record,
                        });
                    }
                    Err(StoreError::Conflict(_)) => continue,
                    Err(err) => return Err(err.into()),
                }
            };

            let mut record: IdempotencyRecord = decode_document(&document)?;
            match record.status {
                IdempotencyStatus::Completed => {
                    let response = record.response.clone().ok_or_else(|| {
                        StoreError::Corrupt(format!(
                            "completed idempotency record {document_id} has no response"
                        ))
                    })?;
                    return Ok(BeginOutcome::Duplicate {
                        response,
                    });
                }
                IdempotencyStatus::Processing if !record.lock_lapsed(now) => {
                    return Ok(BeginOutcome::InProgress);
                }
                IdempotencyStatus::Processing
                    if record.attempts < self.config.max_attempts =>
                {
                    record.attempts += 1;
                    record.lock_expires_at = now.plus_millis(PROCESSING_LOCK_TTL_MILLIS);
                    record.updated_at = now;
                    let update = encode_document(
                        document_id.clone(),
                        tenant_id.clone(),
                        &record,
                        document.expires_at,
                        0,
                    )?;
                    let transaction = Transaction::new()
                        .require(Precondition::Version {
                            collection: Collection::Idempotency,
                            id: document_id.clone(),
                            expected: document.version,
                        })
                        .write(WriteOp::Put {
                            collection: Collection::Idempotency,
                            document: update,
                        });
                    match self.store.commit(transaction, now) {
                        Ok(()) => {
                            return Ok(BeginOutcome::New {
                                record,
                            });
                        }
                        Err(StoreError::Conflict(_)) => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
                IdempotencyStatus::Processing | IdempotencyStatus::Failed => {
                    return Ok(BeginOutcome::Exhausted);
                }
            }
        }
        Err(IdempotencyError::Contention(key.to_string()))
    }

    /// Finalizes a handled event as completed with its cacheable response.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::RecordNotFound`] when no record exists
    /// and [`IdempotencyError`] on store failure.
    pub fn finalize_success(
        &self,
        tenant_id: &TenantId,
        key: &str,
        response: CachedResponse,
        now: Timestamp,
    ) -> Result<IdempotencyRecord, IdempotencyError> {
        self.finalize(
            tenant_id,
            key,
            IdempotencyStatus::Completed,
            Some(response),
            now.plus_millis(COMPLETED_TTL_MILLIS),
            now,
        )
    }

    /// Finalizes a handled event as failed.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::RecordNotFound`] when no record exists
    /// and [`IdempotencyError`] on store failure.
    pub fn finalize_failure(
        &self,
        tenant_id: &TenantId,
        key: &str,
        now: Timestamp,
    ) -> Result<IdempotencyRecord, IdempotencyError> {
        self.finalize(
            tenant_id,
            key,
            IdempotencyStatus::Failed,
            None,
            now.plus_millis(FAILED_TTL_MILLIS),
            now,
        )
    }

    /// Applies a terminal status and TTL to a record.
    fn finalize(
        &self,
        tenant_id: &TenantId,
        key: &str,
        status: IdempotencyStatus,
        response: Option<CachedResponse>,
        expires_at: Timestamp,
        now: Timestamp,
    ) -> Result<IdempotencyRecord, IdempotencyError> {
        let document_id = IdempotencyRecord::document_id(tenant_id, key);
        for _ in 0..CAS_RETRIES {
            let document = self
                .store
                .get(Collection::Idempotency, &document_id, now)?
                .ok_or_else(|| IdempotencyError::RecordNotFound(document_id.clone()))?;
            let mut record: IdempotencyRecord = decode_document(&document)?;
            record.status = status;
            record.response.clone_from(&response);
            record.expires_at = Some(expires_at);
            record.updated_at = now;

            let update = encode_document(
                document_id.clone(),
                tenant_id.clone(),
                &record,
                Some(expires_at),
                0,
            )?;
            let transaction = Transaction::new()
                .require(Precondition::Version {
                    collection: Collection::Idempotency,
                    id: document_id.clone(),
                    expected: document.version,
                })
                .write(WriteOp::Put {
                    collection: Collection::Idempotency,
                    document: update,
                });
            match self.store.commit(transaction, now) {
                Ok(()) => return Ok(record),
                Err(StoreError::Conflict(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Err(IdempotencyError::Contention(key.to_string()))
    }
}

// ============================================================================
// SECTION: Lock Manager
// ============================================================================

/// Exclusive run lock manager.
#[derive(Debug, Clone)]
pub struct LockManager<S> {
    /// Document store port.
    store: S,
    /// Lock duration granted per acquisition and heartbeat.
    ttl_millis: i64,
}

impl<S> LockManager<S>
where
    S: DocumentStore,
{
    /// Creates a lock manager with the default TTL.
    #[must_use]
    pub const fn new(store: S) -> Self {
        Self {
            store,
            ttl_millis: DEFAULT_RUN_LOCK_TTL_MILLIS,
        }
    }

    /// Creates a lock manager with a custom TTL.
    #[must_use]
    pub const fn with_ttl(store: S, ttl_millis: i64) -> Self {
        Self {
            store,
            ttl_millis,
        }
    }

    /// Acquires the run lock for a worker.
    ///
    /// A lapsed lock is taken over; the new holder must read the latest
    /// checkpoint and step set before mutating the run. Re-acquisition by
    /// the current live holder extends the TTL.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Held`] when another worker holds a live lock.
    pub fn acquire(
        &self,
        run_id: &RunId,
        worker: &WorkerId,
        tenant_id: &TenantId,
        now: Timestamp,
    ) -> Result<RunLock, LockError> {
        let document_id = RunLock::document_id(run_id);
        let existing = self.store.get(Collection::RunLocks, &document_id, now)?;
        let lock = RunLock {
            run_id: run_id.clone(),
            holder: worker.clone(),
            acquired_at: now,
            expires_at: now.plus_millis(self.ttl_millis),
        };

        let transaction = match existing {
            None => {
                let document = encode_document(
                    document_id.clone(),
                    tenant_id.clone(),
                    &lock,
                    Some(lock.expires_at),
                    0,
                )?;
                Transaction::new()
                    .require(Precondition::Absent {
                        collection: Collection::RunLocks,
                        id: document_id,
                    })
                    .write(WriteOp::Put {
                        collection: Collection::RunLocks,
                        document,
                    })
            }
            Some(document) => {
                let current: RunLock = decode_document(&document)?;
                if !current.lapsed(now) && current.holder != *worker {
                    return Err(LockError::Held {
                        holder: current.holder,
                    });
                }
                let update = encode_document(
                    document_id.clone(),
                    tenant_id.clone(),
                    &lock,
                    Some(lock.expires_at),
                    0,
                )?;
                Transaction::new()
                    .require(Precondition::Version {
                        collection: Collection::RunLocks,
                        id: document_id,
                        expected: document.version,
                    })
                    .write(WriteOp::Put {
                        collection: Collection::RunLocks,
                        document: update,
                    })
            }
        };

        match self.store.commit(transaction, now) {
            Ok(()) => Ok(lock),
            Err(StoreError::Conflict(detail)) => Err(LockError::Store(StoreError::Conflict(detail))),
            Err(err) => Err(err.into()),
        }
    }

    /// Extends the caller's lock TTL.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotHolder`] when another worker holds the lock,
    /// [`LockError::Expired`] when the caller's lock already lapsed, and
    /// [`LockError::NotFound`] when no lock exists.
    pub fn heartbeat(
        &self,
        run_id: &RunId,
        worker: &WorkerId,
        tenant_id: &TenantId,
        now: Timestamp,
    ) -> Result<RunLock, LockError> {
        let document_id = RunLock::document_id(run_id);
        let document = self
            .store
            .get(Collection::RunLocks, &document_id, now)?
            .ok_or_else(|| LockError::NotFound(run_id.to_string()))?;
        let mut lock: RunLock = decode_document(&document)?;
        if lock.holder != *worker {
            return Err(LockError::NotHolder);
        }
        if lock.lapsed(now) {
            return Err(LockError::Expired);
        }

        lock.expires_at = now.plus_millis(self.ttl_millis);
        let update = encode_document(
            document_id.clone(),
            tenant_id.clone(),
            &lock,
            Some(lock.expires_at),
            0,
        )?;
        let transaction = Transaction::new()
            .require(Precondition::Version {
                collection: Collection::RunLocks,
                id: document_id,
                expected: document.version,
            })
            .write(WriteOp::Put {
                collection: Collection::RunLocks,
                document: update,
            });
        self.store.commit(transaction, now)?;
        Ok(lock)
    }

    /// Releases the caller's lock.
    ///
    /// Releasing a lock another worker took over is a no-op so a lapsed
    /// holder cannot clobber the new holder.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] on store failure.
    pub fn release(
        &self,
        run_id: &RunId,
        worker: &WorkerId,
        now: Timestamp,
    ) -> Result<(), LockError> {
        let document_id = RunLock::document_id(run_id);
        let Some(document) = self.store.get(Collection::RunLocks, &document_id, now)? else {
            return Ok(());
        };
        let lock: RunLock = decode_document(&document)?;
        if lock.holder != *worker {
            return Ok(());
        }
        let transaction = Transaction::new()
            .require(Precondition::Version {
                collection: Collection::RunLocks,
                id: document_id.clone(),
                expected: document.version,
            })
            .write(WriteOp::Delete {
                collection: Collection::RunLocks,
                id: document_id,
            });
        match self.store.commit(transaction, now) {
            Ok(()) | Err(StoreError::Conflict(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Reads the current lock document for a run, if any.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] on store failure.
    pub fn current(&self, run_id: &RunId, now: Timestamp) -> Result<Option<RunLock>, LockError> {
        let document_id = RunLock::document_id(run_id);
        let Some(document) = self.store.get(Collection::RunLocks, &document_id, now)? else {
            return Ok(None);
        };
        Ok(Some(decode_document(&document)?))
    }
}
