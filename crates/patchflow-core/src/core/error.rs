// crates/patchflow-core/src/core/error.rs
// ============================================================================
// Module: Patchflow Error Taxonomy
// Description: Result-shaped error values with stable codes and retry class.
// Purpose: Carry {code, retryable, context} across every operation boundary.
// Dependencies: serde, thiserror
// ============================================================================

//! ## Overview
//! Every public Patchflow operation returns either a value or a typed error.
//! The taxonomy is closed: inbound handlers map kinds to stable HTTP status
//! codes, the reliability kernel inspects `retryable` to decide on backoff,
//! and step failures persist the error as a structured record. Exceptions are
//! never used for control flow.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// SECTION: Error Kind
// ============================================================================

/// Closed error taxonomy for Patchflow operations.
///
/// # Invariants
/// - Variants are stable for serialization and HTTP/status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Inputs violate schema or protocol requirements.
    Validation,
    /// Operation blocked by tenant, rate, or approval policy.
    PolicyDenied,
    /// Flow signal: the run must pause for human approval.
    ApprovalRequired,
    /// Signature, hash, or expiry check failed on an approval decision.
    ApprovalInvalid,
    /// Another worker holds the run lock.
    LockConflict,
    /// A deadline elapsed before the call completed.
    Timeout,
    /// Network or upstream failure expected to clear on retry.
    Transient,
    /// Failure that will not clear on retry.
    Permanent,
    /// Unexpected internal failure.
    Internal,
}

impl ErrorKind {
    /// Returns the default retry classification for the kind.
    #[must_use]
    pub const fn default_retryable(self) -> bool {
        matches!(self, Self::LockConflict | Self::Timeout | Self::Transient)
    }

    /// Returns the stable snake_case label for the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::PolicyDenied => "policy_denied",
            Self::ApprovalRequired => "approval_required",
            Self::ApprovalInvalid => "approval_invalid",
            Self::LockConflict => "lock_conflict",
            Self::Timeout => "timeout",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Internal => "internal",
        }
    }
}

// ============================================================================
// SECTION: Core Error
// ============================================================================

/// Typed error value carried across Patchflow boundaries.
///
/// # Invariants
/// - `code` is a stable machine-readable identifier.
/// - `retryable` is authoritative; the kind's default may be overridden at
///   construction (an open circuit is transient but must not be retried).
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct CoreError {
    /// Taxonomy kind.
    pub kind: ErrorKind,
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable message safe to surface to clients.
    pub message: String,
    /// Whether the reliability kernel may retry the operation.
    pub retryable: bool,
    /// Structured context for diagnostics.
    pub context: BTreeMap<String, String>,
}

impl CoreError {
    /// Creates an error with the kind's default retry classification.
    #[must_use]
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            retryable: kind.default_retryable(),
            context: BTreeMap::new(),
        }
    }

    /// Overrides the retry classification.
    #[must_use]
    pub const fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Attaches a context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, code, message)
    }

    /// Creates a policy-denied error.
    #[must_use]
    pub fn policy_denied(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PolicyDenied, code, message)
    }

    /// Creates an approval-invalid error with a stable reason code.
    #[must_use]
    pub fn approval_invalid(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(ErrorKind::ApprovalInvalid, reason.clone(), format!("approval invalid: {reason}"))
    }

    /// Creates a lock-conflict error.
    #[must_use]
    pub fn lock_conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LockConflict, "lock_conflict", message)
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, "timeout", message)
    }

    /// Creates a transient error.
    #[must_use]
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, code, message)
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, code, message)
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, "internal", message)
    }

    /// Creates the rate-limited rejection.
    ///
    /// Rate-limit rejections are policy denials and are never retried by the
    /// reliability kernel.
    #[must_use]
    pub fn rate_limited(key: impl Into<String>) -> Self {
        Self::new(ErrorKind::PolicyDenied, "rate_limited", "rate limit exceeded")
            .with_context("key", key)
    }

    /// Creates the open-circuit rejection.
    ///
    /// The failure class is transient but retrying before the cooldown
    /// elapses cannot succeed, so the error is marked non-retryable.
    #[must_use]
    pub fn circuit_open(name: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, "circuit_open", "circuit breaker is open")
            .with_retryable(false)
            .with_context("breaker", name)
    }
}

// ============================================================================
// SECTION: Persisted Error Record
// ============================================================================

/// Structured error record persisted on runs and steps.
///
/// # Invariants
/// - `code` and `kind` mirror the [`CoreError`] that caused the failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Taxonomy kind.
    pub kind: ErrorKind,
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Retry classification at time of failure.
    pub retryable: bool,
    /// Structured context for diagnostics.
    pub context: BTreeMap<String, String>,
}

impl From<&CoreError> for ErrorRecord {
    fn from(error: &CoreError) -> Self {
        Self {
            kind: error.kind,
            code: error.code.clone(),
            message: error.message.clone(),
            retryable: error.retryable,
            context: error.context.clone(),
        }
    }
}
