// crates/patchflow-core/src/lib.rs
// ============================================================================
// Module: Patchflow Core Library
// Description: Public API surface for the Patchflow run execution substrate.
// Purpose: Expose the data model, ports, engine, and runtime components.
// Dependencies: crate::{core, engine, gate, idempotency, interfaces, ledger,
//               pipeline, reliability, store}
// ============================================================================

//! ## Overview
//! Patchflow core is the run execution substrate shared by every surface: a
//! persistent, resumable state machine over runs and steps; an idempotency
//! and locking layer; a prompt-routed pipeline orchestrator; a signed,
//! hash-bound approval gate; and a reliability kernel. It is backend
//! agnostic and integrates through explicit ports rather than embedding
//! storage, model, or host details.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod core;
pub mod engine;
pub mod gate;
pub mod idempotency;
pub mod interfaces;
pub mod ledger;
pub mod pipeline;
pub mod reliability;
pub mod store;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use self::core::*;

pub use engine::CreateRun;
pub use engine::EngineConfig;
pub use engine::EngineError;
pub use engine::ResumePoint;
pub use engine::ResumeReason;
pub use engine::RunStateEngine;
pub use engine::StepOutcome;
pub use gate::ApprovalGate;
pub use gate::GateError;
pub use gate::GateOutcome;
pub use idempotency::BeginOutcome;
pub use idempotency::IdempotencyConfig;
pub use idempotency::IdempotencyError;
pub use idempotency::IdempotencyGate;
pub use idempotency::LockError;
pub use idempotency::LockManager;
pub use interfaces::ApproverKeyring;
pub use interfaces::BusError;
pub use interfaces::BusEvent;
pub use interfaces::CapabilityError;
pub use interfaces::Clock;
pub use interfaces::Collection;
pub use interfaces::ConnectorError;
pub use interfaces::DispatchReceipt;
pub use interfaces::DocumentQuery;
pub use interfaces::DocumentStore;
pub use interfaces::EventBus;
pub use interfaces::HostConnector;
pub use interfaces::HostMutation;
pub use interfaces::ModelCapability;
pub use interfaces::ModelRequest;
pub use interfaces::ModelResponse;
pub use interfaces::NoopEventBus;
pub use interfaces::Precondition;
pub use interfaces::SharedBus;
pub use interfaces::Sleeper;
pub use interfaces::StoreError;
pub use interfaces::StoredDocument;
pub use interfaces::Transaction;
pub use interfaces::WriteOp;
pub use ledger::ChainViolation;
pub use ledger::LedgerError;
pub use pipeline::Orchestrator;
pub use pipeline::OrchestratorConfig;
pub use pipeline::OrchestratorError;
pub use pipeline::RunProgress;
pub use pipeline::StageInput;
pub use pipeline::StageOutput;
pub use reliability::BreakerConfig;
pub use reliability::BreakerRegistry;
pub use reliability::BreakerState;
pub use reliability::CircuitBreaker;
pub use reliability::RateLimitConfig;
pub use reliability::SlidingWindowLimiter;
pub use store::SharedStore;
pub use store::memory::MemoryStore;
