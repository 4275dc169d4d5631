// crates/patchflow-http/src/lib.rs
// ============================================================================
// Module: Patchflow HTTP Library
// Description: Inbound HTTP surface for the Patchflow control plane.
// Purpose: Expose webhook intake, run mutations, approvals, and reads.
// Dependencies: crate::{audit, auth, clock, server}
// ============================================================================

//! ## Overview
//! This crate hosts the axum surface over the core run substrate: HMAC
//! verified webhook intake, idempotent run mutations with byte-identical
//! replay, signed approval decisions, and tenant-scoped reads. Workers are
//! separate processes; this surface only persists and serves state.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod audit;
pub mod auth;
pub mod clock;
pub mod server;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use audit::FileAuditSink;
pub use audit::HttpAuditEvent;
pub use audit::HttpAuditSink;
pub use audit::NoopAuditSink;
pub use audit::StderrAuditSink;
pub use auth::SignatureError;
pub use auth::sign_body;
pub use auth::verify_signature;
pub use clock::SystemClock;
pub use clock::ThreadSleeper;
pub use server::HEADER_CLIENT_ID;
pub use server::HEADER_CORRELATION;
pub use server::HEADER_DELIVERY_ID;
pub use server::HEADER_IDEMPOTENCY_KEY;
pub use server::HEADER_REPLAY;
pub use server::HEADER_REQUEST_ID;
pub use server::HEADER_SIGNATURE;
pub use server::HEADER_TENANT;
pub use server::ServerError;
pub use server::ServerState;
pub use server::router;
pub use server::run_expiry_sweep;
pub use server::serve;
