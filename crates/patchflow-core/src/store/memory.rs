// crates/patchflow-core/src/store/memory.rs
// ============================================================================
// Module: Patchflow In-Memory Store
// Description: In-memory document store for tests and local demos.
// Purpose: Provide a deterministic store implementation without external
//          dependencies.
// Dependencies: crate::core, crate::interfaces, serde_json
// ============================================================================

//! ## Overview
//! This module implements the [`DocumentStore`] port over mutex-guarded
//! `BTreeMap` collections. TTL is lazy: expired documents are invisible to
//! reads and eligible for overwrite. Transactions check every precondition
//! before applying any write, all under one lock, which satisfies the
//! serializable contract for a single process. It is not intended for
//! production use.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use serde_json::Value;

use crate::core::Timestamp;
use crate::interfaces::Collection;
use crate::interfaces::DocumentQuery;
use crate::interfaces::DocumentStore;
use crate::interfaces::Precondition;
use crate::interfaces::StoreError;
use crate::interfaces::StoredDocument;
use crate::interfaces::Transaction;
use crate::interfaces::WriteOp;

// ============================================================================
// SECTION: In-Memory Store
// ============================================================================

/// Collection name to document map pairing.
type CollectionMap = BTreeMap<Collection, BTreeMap<String, StoredDocument>>;

/// In-memory document store for tests and examples.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    /// Collections protected by a single mutex.
    collections: Arc<Mutex<CollectionMap>>,
}

impl MemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            collections: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Locks the collection map or reports mutex poisoning.
    fn locked(&self) -> Result<std::sync::MutexGuard<'_, CollectionMap>, StoreError> {
        self.collections
            .lock()
            .map_err(|_| StoreError::Store("memory store mutex poisoned".to_string()))
    }
}

/// Returns true when a document is expired at `now`.
fn expired(document: &StoredDocument, now: Timestamp) -> bool {
    document.expires_at.is_some_and(|expiry| !now.is_before(expiry))
}

/// Reads a string field from a document body.
fn body_str<'a>(document: &'a StoredDocument, field: &str) -> Option<&'a str> {
    document.body.get(field).and_then(Value::as_str)
}

/// Reads an integer field from a document body.
fn body_i64(document: &StoredDocument, field: &str) -> Option<i64> {
    document.body.get(field).and_then(Value::as_i64)
}

/// Returns the live documents of a collection at `now`.
fn live<'a>(
    collections: &'a CollectionMap,
    collection: Collection,
    now: Timestamp,
) -> impl Iterator<Item = &'a StoredDocument> {
    collections
        .get(&collection)
        .into_iter()
        .flat_map(BTreeMap::values)
        .filter(move |document| !expired(document, now))
}

/// Evaluates one query variant against live documents.
fn run_query(
    collections: &CollectionMap,
    collection: Collection,
    query: &DocumentQuery,
    now: Timestamp,
) -> Vec<StoredDocument> {
    let mut results: Vec<StoredDocument> = match query {
        DocumentQuery::RunsByTenantStatus {
            tenant_id,
            status,
            created_from,
            created_to,
        } => live(collections, collection, now)
            .filter(|document| &document.tenant_id == tenant_id)
            .filter(|document| {
                status.as_ref().is_none_or(|wanted| {
                    body_str(document, "status") == Some(wanted.as_str())
                })
            })
            .filter(|document| {
                let created = body_i64(document, "created_at").unwrap_or(i64::MIN);
                created_from.is_none_or(|from| created >= from.as_unix_millis())
                    && created_to.is_none_or(|to| created < to.as_unix_millis())
            })
            .cloned()
            .collect(),
        DocumentQuery::StepsByRun {
            run_id,
        }
        | DocumentQuery::CheckpointsByRun {
            run_id,
        }
        | DocumentQuery::LocksByRun {
            run_id,
        }
        | DocumentQuery::ApprovalsByRun {
            run_id,
        } => live(collections, collection, now)
            .filter(|document| body_str(document, "run_id") == Some(run_id.as_str()))
            .cloned()
            .collect(),
        DocumentQuery::AuditByTenant {
            tenant_id,
            recorded_from,
        } => live(collections, collection, now)
            .filter(|document| &document.tenant_id == tenant_id)
            .filter(|document| {
                let recorded = body_i64(document, "recorded_at").unwrap_or(i64::MIN);
                recorded_from.is_none_or(|from| recorded >= from.as_unix_millis())
            })
            .cloned()
            .collect(),
    };

    // Ordinal order for steps, sequence order for audit events, id order
    // otherwise. Ids embed timestamps, so id order is creation order.
    match query {
        DocumentQuery::StepsByRun { .. } => {
            results.sort_by_key(|document| body_i64(document, "ordinal").unwrap_or(i64::MAX));
        }
        DocumentQuery::AuditByTenant { .. } => {
            results.sort_by_key(|document| body_i64(document, "seq").unwrap_or(i64::MAX));
        }
        _ => results.sort_by(|a, b| a.id.cmp(&b.id)),
    }
    results
}

impl DocumentStore for MemoryStore {
    fn get(
        &self,
        collection: Collection,
        id: &str,
        now: Timestamp,
    ) -> Result<Option<StoredDocument>, StoreError> {
        let guard = self.locked()?;
        Ok(guard
            .get(&collection)
            .and_then(|documents| documents.get(id))
            .filter(|document| !expired(document, now))
            .cloned())
    }

    fn query(
        &self,
        collection: Collection,
        query: &DocumentQuery,
        now: Timestamp,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        let guard = self.locked()?;
        Ok(run_query(&guard, collection, query, now))
    }

    fn commit(&self, transaction: Transaction, now: Timestamp) -> Result<(), StoreError> {
        let mut touched: Vec<(Collection, &str)> = Vec::new();
        for precondition in &transaction.preconditions {
            let (collection, id) = match precondition {
                Precondition::Absent {
                    collection,
                    id,
                }
                | Precondition::Version {
                    collection,
                    id,
                    ..
                } => (*collection, id.as_str()),
            };
            if !touched.contains(&(collection, id)) {
                touched.push((collection, id));
            }
        }
        for write in &transaction.writes {
            let (collection, id) = match write {
                WriteOp::Put {
                    collection,
                    document,
                } => (*collection, document.id.as_str()),
                WriteOp::Delete {
                    collection,
                    id,
                } => (*collection, id.as_str()),
            };
            if !touched.contains(&(collection, id)) {
                touched.push((collection, id));
            }
        }
        if touched.len() > Transaction::MAX_DOCUMENTS {
            return Err(StoreError::TransactionTooLarge(touched.len()));
        }

        let mut guard = self.locked()?;

        for precondition in &transaction.preconditions {
            match precondition {
                Precondition::Absent {
                    collection,
                    id,
                } => {
                    let present = guard
                        .get(collection)
                        .and_then(|documents| documents.get(id))
                        .is_some_and(|document| !expired(document, now));
                    if present {
                        return Err(StoreError::Conflict(format!(
                            "{}/{id} already exists",
                            collection.as_str()
                        )));
                    }
                }
                Precondition::Version {
                    collection,
                    id,
                    expected,
                } => {
                    let version = guard
                        .get(collection)
                        .and_then(|documents| documents.get(id))
                        .filter(|document| !expired(document, now))
                        .map(|document| document.version);
                    if version != Some(*expected) {
                        return Err(StoreError::Conflict(format!(
                            "{}/{id} version mismatch: expected {expected}, found {version:?}",
                            collection.as_str()
                        )));
                    }
                }
            }
        }

        for write in transaction.writes {
            match write {
                WriteOp::Put {
                    collection,
                    mut document,
                } => {
                    let documents = guard.entry(collection).or_default();
                    let next_version = documents
                        .get(&document.id)
                        .map_or(1, |existing| existing.version + 1);
                    document.version = next_version;
                    documents.insert(document.id.clone(), document);
                }
                WriteOp::Delete {
                    collection,
                    id,
                } => {
                    if let Some(documents) = guard.get_mut(&collection) {
                        documents.remove(&id);
                    }
                }
            }
        }
        Ok(())
    }
}
