// crates/patchflow-core/src/reliability/rate_limit.rs
// ============================================================================
// Module: Patchflow Rate Limiting
// Description: Sliding-window limiter over tenant-scoped keys.
// Purpose: Bound request rates with pluggable in-memory or durable storage.
// Dependencies: crate::{core, interfaces, store}, serde
// ============================================================================

//! ## Overview
//! The limiter stores admission timestamps inside the window and admits a
//! request iff the live sample count is below the limit, so exactly `limit`
//! requests pass per window and never one more. Storage is pluggable: the
//! in-memory store covers a single process; the document store variant uses
//! compare-and-swap over a timestamp-list document with a TTL equal to the
//! window for distributed enforcement. Keys are strictly tenant-scoped;
//! there is no global tier.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::core::CoreError;
use crate::core::TenantId;
use crate::core::Timestamp;
use crate::interfaces::Collection;
use crate::interfaces::DocumentStore;
use crate::interfaces::Precondition;
use crate::interfaces::StoreError;
use crate::interfaces::Transaction;
use crate::interfaces::WriteOp;
use crate::store::decode_document;
use crate::store::encode_document;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Sliding-window limiter parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Admissions allowed per window.
    pub limit: u32,
    /// Window length in milliseconds.
    pub window_millis: i64,
}

// ============================================================================
// SECTION: Decisions and Errors
// ============================================================================

/// Limiter decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The request is admitted.
    Admitted,
    /// The request exceeds the limit.
    Limited {
        /// Milliseconds until the oldest sample leaves the window.
        retry_after_millis: i64,
    },
}

/// Rate-limit store errors.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// Backing store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Concurrent admits exhausted the compare-and-swap budget.
    #[error("rate limit contention for key {0}")]
    Contention(String),
}

// ============================================================================
// SECTION: Store Port
// ============================================================================

/// Pluggable sample storage for the sliding window.
pub trait RateLimitStore: Send + Sync {
    /// Atomically prunes expired samples and admits or rejects a request.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError`] when the backing store fails.
    fn admit(
        &self,
        tenant_id: &TenantId,
        key: &str,
        config: &RateLimitConfig,
        now: Timestamp,
    ) -> Result<RateDecision, RateLimitError>;
}

// ============================================================================
// SECTION: In-Memory Store
// ============================================================================

/// Single-process sample store.
#[derive(Debug, Default)]
pub struct InMemoryRateLimitStore {
    /// Sample lists keyed by limiter key.
    windows: Mutex<BTreeMap<String, Vec<Timestamp>>>,
}

impl InMemoryRateLimitStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Decides admission over a pruned sample list and pushes the new sample.
fn decide(samples: &mut Vec<Timestamp>, config: &RateLimitConfig, now: Timestamp) -> RateDecision {
    samples.retain(|sample| now.millis_since(*sample) < config.window_millis);
    if samples.len() < config.limit as usize {
        samples.push(now);
        RateDecision::Admitted
    } else {
        let oldest = samples.first().copied().unwrap_or(now);
        RateDecision::Limited {
            retry_after_millis: config.window_millis.saturating_sub(now.millis_since(oldest)),
        }
    }
}

impl RateLimitStore for InMemoryRateLimitStore {
    fn admit(
        &self,
        _tenant_id: &TenantId,
        key: &str,
        config: &RateLimitConfig,
        now: Timestamp,
    ) -> Result<RateDecision, RateLimitError> {
        let mut windows = self
            .windows
            .lock()
            .map_err(|_| StoreError::Store("rate limit mutex poisoned".to_string()))?;
        let samples = windows.entry(key.to_string()).or_default();
        Ok(decide(samples, config, now))
    }
}

// ============================================================================
// SECTION: Document Store Backend
// ============================================================================

/// Bounded compare-and-swap retries for the durable store.
const CAS_RETRIES: u32 = 3;

/// Persisted sample document for one limiter key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SampleDocument {
    /// Limiter key.
    key: String,
    /// Admission timestamps inside the window.
    samples: Vec<Timestamp>,
}

/// Durable sample store over the document-store port.
#[derive(Debug, Clone)]
pub struct DocumentRateLimitStore<S> {
    /// Document store port.
    store: S,
}

impl<S> DocumentRateLimitStore<S>
where
    S: DocumentStore,
{
    /// Creates a durable sample store.
    #[must_use]
    pub const fn new(store: S) -> Self {
        Self {
            store,
        }
    }
}

impl<S> RateLimitStore for DocumentRateLimitStore<S>
where
    S: DocumentStore,
{
    fn admit(
        &self,
        tenant_id: &TenantId,
        key: &str,
        config: &RateLimitConfig,
        now: Timestamp,
    ) -> Result<RateDecision, RateLimitError> {
        let document_id = format!("rl-{key}");
        for _ in 0..CAS_RETRIES {
            let existing = self.store.get(Collection::RateLimits, &document_id, now)?;
            let (mut sample_doc, precondition) = match &existing {
                Some(document) => {
                    let decoded: SampleDocument = decode_document(document)?;
                    (
                        decoded,
                        Precondition::Version {
                            collection: Collection::RateLimits,
                            id: document_id.clone(),
                            expected: document.version,
                        },
                    )
                }
                None => (
                    SampleDocument {
                        key: key.to_string(),
                        samples: Vec::new(),
                    },
                    Precondition::Absent {
                        collection: Collection::RateLimits,
                        id: document_id.clone(),
                    },
                ),
            };

            let decision = decide(&mut sample_doc.samples, config, now);
            if matches!(decision, RateDecision::Limited { .. }) {
                return Ok(decision);
            }

            let document = encode_document(
                document_id.clone(),
                tenant_id.clone(),
                &sample_doc,
                Some(now.plus_millis(config.window_millis)),
                0,
            )?;
            let transaction = Transaction::new().require(precondition).write(WriteOp::Put {
                collection: Collection::RateLimits,
                document,
            });
            match self.store.commit(transaction, now) {
                Ok(()) => return Ok(decision),
                Err(StoreError::Conflict(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Err(RateLimitError::Contention(key.to_string()))
    }
}

// ============================================================================
// SECTION: Limiter
// ============================================================================

/// Sliding-window limiter over tenant-scoped operation keys.
#[derive(Debug, Clone)]
pub struct SlidingWindowLimiter<R> {
    /// Sample storage.
    store: R,
    /// Limiter parameters.
    config: RateLimitConfig,
}

impl<R> SlidingWindowLimiter<R>
where
    R: RateLimitStore,
{
    /// Creates a limiter.
    #[must_use]
    pub const fn new(store: R, config: RateLimitConfig) -> Self {
        Self {
            store,
            config,
        }
    }

    /// Admits or rejects one request for a tenant-scoped operation.
    ///
    /// # Errors
    ///
    /// Returns the `rate_limited` policy error on rejection and an internal
    /// error when the backing store fails.
    pub fn check(
        &self,
        tenant_id: &TenantId,
        operation: &str,
        now: Timestamp,
    ) -> Result<(), CoreError> {
        let key = format!("{}:{operation}", tenant_id.as_str());
        let decision = self
            .store
            .admit(tenant_id, &key, &self.config, now)
            .map_err(|err| CoreError::internal(err.to_string()))?;
        match decision {
            RateDecision::Admitted => Ok(()),
            RateDecision::Limited {
                retry_after_millis,
            } => Err(CoreError::rate_limited(key)
                .with_context("retry_after_millis", retry_after_millis.to_string())),
        }
    }
}
