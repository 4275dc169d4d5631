// crates/patchflow-http/src/audit.rs
// ============================================================================
// Module: Patchflow HTTP Audit Logging
// Description: Structured audit events for inbound request handling.
// Purpose: Emit request-level audit lines without hard logging dependencies.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! This module defines the request-level audit event and its sinks. It is
//! intentionally lightweight so deployments can route events to their
//! preferred logging pipeline without redesign: stderr JSON lines by
//! default, an append-only file sink, or a no-op sink for tests. These
//! events complement, and never replace, the tamper-evident core ledger.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use serde::Serialize;

// ============================================================================
// SECTION: Event
// ============================================================================

/// Request handling outcome classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    /// Handled successfully.
    Ok,
    /// Replayed a cached idempotent response.
    Replayed,
    /// Rejected by validation or policy.
    Rejected,
    /// Failed internally.
    Error,
}

/// HTTP request audit event payload.
#[derive(Debug, Clone, Serialize)]
pub struct HttpAuditEvent {
    /// Event identifier.
    pub event: &'static str,
    /// Event timestamp in unix milliseconds.
    pub timestamp_ms: i64,
    /// Request method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Tenant when identified.
    pub tenant: Option<String>,
    /// Response status code.
    pub status: u16,
    /// Outcome classification.
    pub outcome: RequestOutcome,
    /// Request body size in bytes.
    pub request_bytes: usize,
    /// Response body size in bytes.
    pub response_bytes: usize,
    /// Correlation identifier echoed to the client.
    pub correlation_id: Option<String>,
}

// ============================================================================
// SECTION: Sink Trait
// ============================================================================

/// Pluggable sink for HTTP audit events.
pub trait HttpAuditSink: Send + Sync {
    /// Emits one event; sinks must not fail the request path.
    fn emit(&self, event: &HttpAuditEvent);
}

// ============================================================================
// SECTION: Sinks
// ============================================================================

/// Sink that discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditSink;

impl HttpAuditSink for NoopAuditSink {
    fn emit(&self, _event: &HttpAuditEvent) {}
}

/// Sink writing JSON lines to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrAuditSink;

impl HttpAuditSink for StderrAuditSink {
    fn emit(&self, event: &HttpAuditEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            let stderr = io::stderr();
            let mut guard = stderr.lock();
            let _ = writeln!(guard, "{line}");
        }
    }
}

/// Sink appending JSON lines to a file.
#[derive(Debug)]
pub struct FileAuditSink {
    /// Open file handle guarded for line-atomic appends.
    file: Mutex<std::fs::File>,
}

impl FileAuditSink {
    /// Opens or creates the audit file in append mode.
    ///
    /// # Errors
    ///
    /// Returns [`io::Error`] when the file cannot be opened.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl HttpAuditSink for FileAuditSink {
    fn emit(&self, event: &HttpAuditEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            if let Ok(mut file) = self.file.lock() {
                let _ = writeln!(file, "{line}");
            }
        }
    }
}
