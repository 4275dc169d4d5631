// crates/patchflow-cli/src/main.rs
// ============================================================================
// Module: Patchflow CLI Entry Point
// Description: Operational command surface for the Patchflow control plane.
// Purpose: Serve the HTTP surface, check configs, and verify audit exports.
// Dependencies: clap, patchflow-config, patchflow-core, patchflow-http,
//               tokio
// ============================================================================

//! ## Overview
//! The CLI wires the composition root for local deployments: it loads and
//! validates configuration, binds the HTTP surface, and offers offline
//! tooling for audit-chain verification. Exit codes follow the external
//! contract: 0 success, 10-19 validation, 20-29 policy denied, 30-39
//! capability or network, 40-49 internal.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use clap::Subcommand;
use patchflow_config::ConfigError;
use patchflow_config::PatchflowConfig;
use patchflow_core::AuditEvent;
use patchflow_core::MemoryStore;
use patchflow_core::NoopEventBus;
use patchflow_core::SharedBus;
use patchflow_core::SharedStore;
use patchflow_core::ledger::verify_chain;
use patchflow_http::ServerState;
use patchflow_http::StderrAuditSink;
use patchflow_http::SystemClock;

// ============================================================================
// SECTION: Exit Codes
// ============================================================================

/// Success.
const EXIT_OK: u8 = 0;

/// Validation failures: bad config, malformed inputs.
const EXIT_VALIDATION: u8 = 10;

/// Policy denials: tamper-evident verification failures.
const EXIT_POLICY: u8 = 20;

/// Capability and network failures: bind or serve errors.
const EXIT_NETWORK: u8 = 30;

/// Internal failures.
const EXIT_INTERNAL: u8 = 40;

// ============================================================================
// SECTION: Arguments
// ============================================================================

/// Patchflow control plane CLI.
#[derive(Debug, Parser)]
#[command(name = "patchflow", version, about = "Patchflow control plane")]
struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    command: Command,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP surface with the in-memory store.
    Serve {
        /// Config file path; falls back to the environment override.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Load and validate a config file, then exit.
    ConfigCheck {
        /// Config file path; falls back to the environment override.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Verify an exported audit-event file (one JSON event per line).
    VerifyLedger {
        /// Exported audit file path.
        #[arg(long)]
        file: PathBuf,
    },
}

// ============================================================================
// SECTION: Entry Point
// ============================================================================

/// CLI entry point.
fn main() -> ExitCode {
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Serve {
            config,
        } => run_serve(config.as_deref()),
        Command::ConfigCheck {
            config,
        } => run_config_check(config.as_deref()),
        Command::VerifyLedger {
            file,
        } => run_verify_ledger(&file),
    };
    ExitCode::from(code)
}

// ============================================================================
// SECTION: Serve
// ============================================================================

/// Loads config and serves the HTTP surface until interrupted.
fn run_serve(config_path: Option<&std::path::Path>) -> u8 {
    let config = match PatchflowConfig::load(config_path) {
        Ok(config) => config,
        Err(err) => return report_config_error(&err),
    };

    let store = SharedStore::from_store(MemoryStore::new());
    let bus = SharedBus::from_bus(NoopEventBus);
    let state = match ServerState::new(
        config,
        store,
        bus,
        Arc::new(SystemClock),
        Arc::new(StderrAuditSink),
        seed_from_entropy(),
    ) {
        Ok(state) => Arc::new(state),
        Err(err) => return report_error(&err.to_string(), EXIT_INTERNAL),
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => return report_error(&err.to_string(), EXIT_INTERNAL),
    };
    match runtime.block_on(patchflow_http::serve(state)) {
        Ok(()) => EXIT_OK,
        Err(err) => report_error(&err.to_string(), EXIT_NETWORK),
    }
}

// ============================================================================
// SECTION: Config Check
// ============================================================================

/// Validates a config file and reports the outcome.
fn run_config_check(config_path: Option<&std::path::Path>) -> u8 {
    match PatchflowConfig::load(config_path) {
        Ok(config) => {
            let summary = serde_json::json!({
                "status": "ok",
                "tenants": config.tenants.len(),
            });
            emit_line(&summary.to_string());
            EXIT_OK
        }
        Err(err) => report_config_error(&err),
    }
}

/// Maps a config error onto the validation exit band.
fn report_config_error(error: &ConfigError) -> u8 {
    report_error(&error.to_string(), EXIT_VALIDATION)
}

// ============================================================================
// SECTION: Ledger Verification
// ============================================================================

/// Verifies per-tenant chains in an exported audit file.
fn run_verify_ledger(path: &std::path::Path) -> u8 {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(err) => return report_error(&err.to_string(), EXIT_VALIDATION),
    };

    let mut chains: std::collections::BTreeMap<String, Vec<AuditEvent>> =
        std::collections::BTreeMap::new();
    for line in BufReader::new(file).lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => return report_error(&err.to_string(), EXIT_VALIDATION),
        };
        if line.trim().is_empty() {
            continue;
        }
        let event: AuditEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(err) => {
                return report_error(&format!("malformed event: {err}"), EXIT_VALIDATION);
            }
        };
        chains.entry(event.tenant_id.as_str().to_string()).or_default().push(event);
    }

    for (tenant, mut events) in chains {
        events.sort_by_key(|event| event.seq);
        if let Err(violation) = verify_chain(&events) {
            let report = serde_json::json!({
                "status": "violated",
                "tenant": tenant,
                "seq": violation.seq,
                "reason": violation.reason,
            });
            emit_line(&report.to_string());
            return EXIT_POLICY;
        }
        let report = serde_json::json!({
            "status": "ok",
            "tenant": tenant,
            "events": events.len(),
        });
        emit_line(&report.to_string());
    }
    EXIT_OK
}

// ============================================================================
// SECTION: Output Helpers
// ============================================================================

/// Writes one line to stdout.
fn emit_line(line: &str) {
    let stdout = io::stdout();
    let mut guard = stdout.lock();
    let _ = writeln!(guard, "{line}");
}

/// Writes an error line to stderr and returns the exit code.
fn report_error(message: &str, code: u8) -> u8 {
    let stderr = io::stderr();
    let mut guard = stderr.lock();
    let _ = writeln!(guard, "{message}");
    code
}

/// Derives an id-minting seed from process entropy.
fn seed_from_entropy() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_nanos() & u128::from(u64::MAX)).unwrap_or(0))
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(
        clippy::panic,
        clippy::unwrap_used,
        clippy::expect_used,
        reason = "Test-only panic-based assertions are permitted."
    )]

    use std::io::Write as _;

    use patchflow_core::AuditEventKind;
    use patchflow_core::MemoryStore;
    use patchflow_core::NoopEventBus;
    use patchflow_core::TenantId;
    use patchflow_core::Timestamp;
    use patchflow_core::hash_canonical_json;
    use patchflow_core::ledger;

    use super::EXIT_OK;
    use super::EXIT_POLICY;
    use super::EXIT_VALIDATION;
    use super::run_config_check;
    use super::run_verify_ledger;

    /// Writes a valid two-event export and verifies it cleanly.
    #[test]
    fn verify_ledger_accepts_a_valid_export() {
        let store = MemoryStore::new();
        let tenant = TenantId::new("acme");
        for index in 0..2 {
            ledger::append(
                &store,
                &NoopEventBus,
                &tenant,
                None,
                "engine",
                AuditEventKind::RunCreated,
                hash_canonical_json(&index).expect("hash"),
                Timestamp::from_unix_millis(1_700_000_000_000 + index),
            )
            .expect("append");
        }
        let events = ledger::load_chain(
            &store,
            &tenant,
            Timestamp::from_unix_millis(1_700_000_100_000),
        )
        .expect("chain");

        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        for event in &events {
            let line = serde_json::to_string(event).expect("line");
            writeln!(file, "{line}").expect("write");
        }
        assert_eq!(run_verify_ledger(file.path()), EXIT_OK);
    }

    /// Verifies a tampered export exits on the policy band.
    #[test]
    fn verify_ledger_rejects_a_tampered_export() {
        let store = MemoryStore::new();
        let tenant = TenantId::new("acme");
        for index in 0..2 {
            ledger::append(
                &store,
                &NoopEventBus,
                &tenant,
                None,
                "engine",
                AuditEventKind::RunCreated,
                hash_canonical_json(&index).expect("hash"),
                Timestamp::from_unix_millis(1_700_000_000_000 + index),
            )
            .expect("append");
        }
        let mut events = ledger::load_chain(
            &store,
            &tenant,
            Timestamp::from_unix_millis(1_700_000_100_000),
        )
        .expect("chain");
        events[0].actor = "forged".to_string();

        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        for event in &events {
            let line = serde_json::to_string(event).expect("line");
            writeln!(file, "{line}").expect("write");
        }
        assert_eq!(run_verify_ledger(file.path()), EXIT_POLICY);
    }

    /// Verifies a missing config maps onto the validation band.
    #[test]
    fn config_check_reports_validation_band() {
        let missing = std::path::Path::new("/nonexistent/patchflow.toml");
        assert_eq!(run_config_check(Some(missing)), EXIT_VALIDATION);
    }
}
