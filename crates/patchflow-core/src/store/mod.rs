// crates/patchflow-core/src/store/mod.rs
// ============================================================================
// Module: Patchflow Storage Helpers
// Description: Document codecs and the in-memory store implementation.
// Purpose: Bridge typed core documents and the document-store port.
// Dependencies: crate::core, crate::interfaces, serde
// ============================================================================

//! ## Overview
//! Core entities persist as JSON bodies inside [`StoredDocument`] envelopes.
//! The codecs here keep encode/decode in one place so every call site fails
//! closed on corrupt data with [`StoreError::Corrupt`].

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod memory;

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::TenantId;
use crate::core::Timestamp;
use crate::interfaces::Collection;
use crate::interfaces::DocumentQuery;
use crate::interfaces::DocumentStore;
use crate::interfaces::StoreError;
use crate::interfaces::StoredDocument;
use crate::interfaces::Transaction;

// ============================================================================
// SECTION: Codecs
// ============================================================================

/// Encodes a typed entity into a stored document envelope.
///
/// The `version` is set to the caller-observed version; the store assigns
/// the next version on commit.
///
/// # Errors
///
/// Returns [`StoreError::Corrupt`] when serialization fails.
pub fn encode_document<T: Serialize>(
    id: impl Into<String>,
    tenant_id: TenantId,
    entity: &T,
    expires_at: Option<Timestamp>,
    version: u64,
) -> Result<StoredDocument, StoreError> {
    let body = serde_json::to_value(entity)
        .map_err(|err| StoreError::Corrupt(format!("encode failed: {err}")))?;
    Ok(StoredDocument {
        id: id.into(),
        tenant_id,
        body,
        expires_at,
        version,
    })
}

/// Decodes a stored document body into a typed entity.
///
/// # Errors
///
/// Returns [`StoreError::Corrupt`] when the body does not match the entity
/// shape.
pub fn decode_document<T: DeserializeOwned>(document: &StoredDocument) -> Result<T, StoreError> {
    serde_json::from_value(document.body.clone())
        .map_err(|err| StoreError::Corrupt(format!("decode failed for {}: {err}", document.id)))
}

// ============================================================================
// SECTION: Shared Store Wrapper
// ============================================================================

/// Document store backed by an `Arc` trait object.
///
/// Lets the composition root hand one store to every component while the
/// components stay generic over [`DocumentStore`].
#[derive(Clone)]
pub struct SharedStore {
    /// Inner store implementation.
    inner: Arc<dyn DocumentStore>,
}

impl SharedStore {
    /// Wraps a store in a shared, clonable wrapper.
    #[must_use]
    pub fn from_store(store: impl DocumentStore + 'static) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    /// Wraps an existing shared store.
    #[must_use]
    pub const fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            inner: store,
        }
    }
}

impl DocumentStore for SharedStore {
    fn get(
        &self,
        collection: Collection,
        id: &str,
        now: Timestamp,
    ) -> Result<Option<StoredDocument>, StoreError> {
        self.inner.get(collection, id, now)
    }

    fn query(
        &self,
        collection: Collection,
        query: &DocumentQuery,
        now: Timestamp,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        self.inner.query(collection, query, now)
    }

    fn commit(&self, transaction: Transaction, now: Timestamp) -> Result<(), StoreError> {
        self.inner.commit(transaction, now)
    }
}
