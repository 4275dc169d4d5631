// crates/patchflow-core/src/interfaces/mod.rs
// ============================================================================
// Module: Patchflow Interfaces
// Description: Backend-agnostic ports for storage, time, models, and hosts.
// Purpose: Define the contract surfaces the runtime composes against.
// Dependencies: crate::core, ed25519-dalek, serde
// ============================================================================

//! ## Overview
//! Ports define how Patchflow integrates with external systems without
//! embedding backend details. There are no module-level singletons in the
//! core: storage, clock, sleeper, model capability, host connector, event
//! bus, and approver keyring are all injected by the composition root.
//! Implementations must fail closed on missing or invalid data.

// ============================================================================
// SECTION: Imports
// ============================================================================

use ed25519_dalek::VerifyingKey;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::Capability;
use crate::core::HashDigest;
use crate::core::ModelTier;
use crate::core::RunId;
use crate::core::RunStatus;
use crate::core::StageKind;
use crate::core::StepStatus;
use crate::core::TargetDescriptor;
use crate::core::TenantId;
use crate::core::Timestamp;
use crate::core::identifiers::ApprovalId;
use crate::core::identifiers::ApproverId;
use crate::core::identifiers::EventId;
use crate::core::identifiers::StepId;

// ============================================================================
// SECTION: Document Store
// ============================================================================

/// Persisted collections, one per core entity.
///
/// # Invariants
/// - Variants are stable; collection names appear in stored layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    /// Run documents.
    Runs,
    /// Step documents.
    Steps,
    /// Checkpoint documents.
    Checkpoints,
    /// Idempotency records.
    Idempotency,
    /// Run lock documents.
    RunLocks,
    /// Approval records.
    Approvals,
    /// Audit events.
    AuditEvents,
    /// Durable sliding-window rate-limit documents.
    RateLimits,
}

impl Collection {
    /// Returns the stable collection name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Runs => "runs",
            Self::Steps => "steps",
            Self::Checkpoints => "checkpoints",
            Self::Idempotency => "idempotency",
            Self::RunLocks => "run_locks",
            Self::Approvals => "approvals",
            Self::AuditEvents => "audit_events",
            Self::RateLimits => "rate_limits",
        }
    }
}

/// Stored document envelope.
///
/// # Invariants
/// - `version` increments on every put; preconditions compare against it.
/// - `expires_at` is honored by the store's TTL policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDocument {
    /// Document identifier, unique within its collection.
    pub id: String,
    /// Tenant the document belongs to.
    pub tenant_id: TenantId,
    /// Document body.
    pub body: Value,
    /// TTL expiry honored by the store.
    pub expires_at: Option<Timestamp>,
    /// Optimistic concurrency version; zero for unwritten documents.
    pub version: u64,
}

/// Typed queries over the indexed fields each collection declares.
///
/// # Invariants
/// - The set is closed; a new access path is a new variant backed by an
///   index, not an ad-hoc filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentQuery {
    /// Runs by `(tenant_id, status, created_at)`.
    RunsByTenantStatus {
        /// Tenant scope.
        tenant_id: TenantId,
        /// Optional status filter.
        status: Option<RunStatus>,
        /// Inclusive lower creation bound.
        created_from: Option<Timestamp>,
        /// Exclusive upper creation bound.
        created_to: Option<Timestamp>,
    },
    /// Steps by `(run_id, ordinal)`, ordered by ordinal.
    StepsByRun {
        /// Run scope.
        run_id: RunId,
    },
    /// Checkpoints by `run_id`.
    CheckpointsByRun {
        /// Run scope.
        run_id: RunId,
    },
    /// Locks by `run_id`.
    LocksByRun {
        /// Run scope.
        run_id: RunId,
    },
    /// Approvals by `run_id`.
    ApprovalsByRun {
        /// Run scope.
        run_id: RunId,
    },
    /// Audit events by `(tenant_id, created_at)`, ordered by sequence.
    AuditByTenant {
        /// Tenant scope.
        tenant_id: TenantId,
        /// Inclusive lower recording bound.
        recorded_from: Option<Timestamp>,
    },
}

/// Transaction precondition over one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// The document must not exist.
    Absent {
        /// Collection to check.
        collection: Collection,
        /// Document identifier.
        id: String,
    },
    /// The document must exist at exactly this version.
    Version {
        /// Collection to check.
        collection: Collection,
        /// Document identifier.
        id: String,
        /// Expected version.
        expected: u64,
    },
}

/// Transaction write operation over one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert or replace a document; the store assigns the next version.
    Put {
        /// Target collection.
        collection: Collection,
        /// Document to write.
        document: StoredDocument,
    },
    /// Delete a document if present.
    Delete {
        /// Target collection.
        collection: Collection,
        /// Document identifier.
        id: String,
    },
}

/// Serializable multi-document transaction.
///
/// # Invariants
/// - A transaction touches at most [`Transaction::MAX_DOCUMENTS`] documents
///   across preconditions and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    /// Preconditions checked atomically before any write applies.
    pub preconditions: Vec<Precondition>,
    /// Writes applied atomically after all preconditions hold.
    pub writes: Vec<WriteOp>,
}

impl Transaction {
    /// Maximum documents a single transaction may span.
    pub const MAX_DOCUMENTS: usize = 5;

    /// Creates an empty transaction.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            preconditions: Vec::new(),
            writes: Vec::new(),
        }
    }

    /// Adds a precondition.
    #[must_use]
    pub fn require(mut self, precondition: Precondition) -> Self {
        self.preconditions.push(precondition);
        self
    }

    /// Adds a write.
    #[must_use]
    pub fn write(mut self, op: WriteOp) -> Self {
        self.writes.push(op);
        self
    }
}

/// Document store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A transaction precondition failed.
    #[error("store transaction conflict: {0}")]
    Conflict(String),
    /// A transaction spans too many documents.
    #[error("store transaction spans too many documents: {0}")]
    TransactionTooLarge(usize),
    /// Stored data failed to decode.
    #[error("store corruption: {0}")]
    Corrupt(String),
    /// Store I/O failure.
    #[error("store io error: {0}")]
    Io(String),
    /// Store reported an error.
    #[error("store error: {0}")]
    Store(String),
}

/// Document store port.
///
/// Consistency contract: strong read-after-write within a single document;
/// serializable transactions over the bounded document set; queries read
/// committed state.
pub trait DocumentStore: Send + Sync {
    /// Loads a document by id, honoring TTL expiry at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when loading fails.
    fn get(
        &self,
        collection: Collection,
        id: &str,
        now: Timestamp,
    ) -> Result<Option<StoredDocument>, StoreError>;

    /// Runs an indexed query, honoring TTL expiry at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails.
    fn query(
        &self,
        collection: Collection,
        query: &DocumentQuery,
        now: Timestamp,
    ) -> Result<Vec<StoredDocument>, StoreError>;

    /// Commits a transaction atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] when a precondition fails and
    /// [`StoreError::TransactionTooLarge`] when the document bound is
    /// exceeded.
    fn commit(&self, transaction: Transaction, now: Timestamp) -> Result<(), StoreError>;
}

// ============================================================================
// SECTION: Clock and Sleeper
// ============================================================================

/// Wall-clock port; the core never reads time directly.
pub trait Clock: Send + Sync {
    /// Returns the current timestamp.
    fn now(&self) -> Timestamp;
}

/// Delay port used by the retry executor so tests never sleep.
pub trait Sleeper: Send + Sync {
    /// Blocks the caller for `millis` milliseconds.
    fn sleep_millis(&self, millis: u64);
}

// ============================================================================
// SECTION: Model Capability
// ============================================================================

/// Request passed to the language-model capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRequest {
    /// Stage kind driving the invocation.
    pub stage: StageKind,
    /// Selected model tier.
    pub tier: ModelTier,
    /// Stage input payload.
    pub input: Value,
    /// Call deadline in milliseconds.
    pub deadline_millis: u64,
}

/// Response returned by the language-model capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Raw model output; stages parse this into typed artifacts.
    pub content: String,
}

/// Language-model capability errors.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// The call exceeded its deadline.
    #[error("model call timed out")]
    Timeout,
    /// The provider is unreachable or overloaded.
    #[error("model provider unavailable: {0}")]
    Unavailable(String),
    /// The provider rejected the request.
    #[error("model request rejected: {0}")]
    Rejected(String),
}

impl CapabilityError {
    /// Returns true when the failure is expected to clear on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable(_))
    }
}

/// Language-model capability port.
///
/// Stages never touch storage or network; the orchestrator owns all side
/// effects around this call.
pub trait ModelCapability: Send + Sync {
    /// Invokes the model for one stage.
    ///
    /// # Errors
    ///
    /// Returns [`CapabilityError`] when the call fails.
    fn invoke(&self, request: &ModelRequest) -> Result<ModelResponse, CapabilityError>;
}

// ============================================================================
// SECTION: Host Connector
// ============================================================================

/// Outbound mutation dispatched to an external host.
///
/// # Invariants
/// - `payload` holds the exact bytes bound by the approval hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMutation {
    /// Capability being exercised.
    pub capability: Capability,
    /// Target the mutation applies to.
    pub target: TargetDescriptor,
    /// Exact mutation payload bytes.
    pub payload: Vec<u8>,
    /// Payload content type.
    pub content_type: String,
}

/// Receipt returned by the host connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReceipt {
    /// Connector-assigned receipt identifier.
    pub receipt_id: String,
    /// Host-specific detail (PR URL, commit SHA, and similar).
    pub detail: Option<String>,
}

/// Host connector errors.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The host rejected the mutation.
    #[error("host rejected mutation: {0}")]
    Rejected(String),
    /// The host is unreachable.
    #[error("host unreachable: {0}")]
    Unreachable(String),
    /// The call exceeded its deadline.
    #[error("host call timed out")]
    Timeout,
}

/// Host connector port; the core never connects to hosts directly.
pub trait HostConnector: Send + Sync {
    /// Dispatches one mutation to the host.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError`] when dispatch fails.
    fn dispatch(&self, mutation: &HostMutation) -> Result<DispatchReceipt, ConnectorError>;
}

// ============================================================================
// SECTION: Event Bus
// ============================================================================

/// Structured events published for external consumers.
///
/// # Invariants
/// - Topics are stable; consumers subscribe by topic string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum BusEvent {
    /// A run moved along a legal status edge.
    RunStateChanged {
        /// Tenant scope.
        tenant_id: TenantId,
        /// Run identifier.
        run_id: RunId,
        /// Prior status.
        from: RunStatus,
        /// New status.
        to: RunStatus,
    },
    /// A step reached a terminal status.
    StepCompleted {
        /// Run identifier.
        run_id: RunId,
        /// Step identifier.
        step_id: StepId,
        /// Terminal status.
        status: StepStatus,
    },
    /// An approval was requested.
    ApprovalRequested {
        /// Run identifier.
        run_id: RunId,
        /// Approval identifier.
        approval_id: ApprovalId,
        /// Bound artifact hash.
        artifact_hash: HashDigest,
    },
    /// An approval was decided.
    ApprovalDecided {
        /// Run identifier.
        run_id: RunId,
        /// Approval identifier.
        approval_id: ApprovalId,
        /// Whether the mutation was authorized.
        approved: bool,
    },
    /// An audit event was appended.
    AuditAppended {
        /// Tenant scope.
        tenant_id: TenantId,
        /// Event identifier.
        event_id: EventId,
        /// Chain sequence.
        seq: u64,
    },
}

impl BusEvent {
    /// Returns the stable topic string for the event.
    #[must_use]
    pub const fn topic(&self) -> &'static str {
        match self {
            Self::RunStateChanged { .. } => "run.state_changed",
            Self::StepCompleted { .. } => "step.completed",
            Self::ApprovalRequested { .. } => "approval.requested",
            Self::ApprovalDecided { .. } => "approval.decided",
            Self::AuditAppended { .. } => "audit.appended",
        }
    }
}

/// Event bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus rejected the publish.
    #[error("bus publish failed: {0}")]
    Publish(String),
}

/// Publish-only event bus port.
pub trait EventBus: Send + Sync {
    /// Publishes one event.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] when publishing fails.
    fn publish(&self, event: &BusEvent) -> Result<(), BusError>;
}

/// Event bus that drops all events; used by tests and offline tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventBus;

impl EventBus for NoopEventBus {
    fn publish(&self, _event: &BusEvent) -> Result<(), BusError> {
        Ok(())
    }
}

/// Event bus backed by an `Arc` trait object.
#[derive(Clone)]
pub struct SharedBus {
    /// Inner bus implementation.
    inner: std::sync::Arc<dyn EventBus>,
}

impl SharedBus {
    /// Wraps a bus in a shared, clonable wrapper.
    #[must_use]
    pub fn from_bus(bus: impl EventBus + 'static) -> Self {
        Self {
            inner: std::sync::Arc::new(bus),
        }
    }

    /// Wraps an existing shared bus.
    #[must_use]
    pub const fn new(bus: std::sync::Arc<dyn EventBus>) -> Self {
        Self {
            inner: bus,
        }
    }
}

impl EventBus for SharedBus {
    fn publish(&self, event: &BusEvent) -> Result<(), BusError> {
        self.inner.publish(event)
    }
}

// ============================================================================
// SECTION: Approver Keyring
// ============================================================================

/// Approver key registry port.
///
/// The keyring is the gate's trust anchor: a missing key or authorization
/// entry fails closed.
pub trait ApproverKeyring: Send + Sync {
    /// Returns the verification key for an approver within a tenant.
    fn verification_key(
        &self,
        tenant_id: &TenantId,
        approver: &ApproverId,
    ) -> Option<VerifyingKey>;

    /// Returns true when the approver may authorize the capability for the
    /// tenant.
    fn is_authorized(
        &self,
        tenant_id: &TenantId,
        approver: &ApproverId,
        capability: Capability,
    ) -> bool;
}
