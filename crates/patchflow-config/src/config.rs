// crates/patchflow-config/src/config.rs
// ============================================================================
// Module: Patchflow Configuration
// Description: Configuration loading and validation for Patchflow.
// Purpose: Provide strict, fail-closed config parsing with hard limits.
// Dependencies: patchflow-core, serde, toml
// ============================================================================

//! ## Overview
//! Configuration is loaded from a TOML file with strict size limits.
//! Missing or invalid configuration fails closed: no tenant runs without a
//! webhook secret, and no approver is trusted without a parseable Ed25519
//! key. Secrets live only in the config file; the core never sees the file
//! path, only the validated values.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use patchflow_core::Capability;
use patchflow_core::DEFAULT_APPROVAL_TTL_MILLIS;
use patchflow_core::DEFAULT_RUN_LOCK_TTL_MILLIS;
use patchflow_core::EngineConfig;
use patchflow_core::reliability::BreakerConfig;
use patchflow_core::reliability::FAST;
use patchflow_core::reliability::PATIENT;
use patchflow_core::reliability::RateLimitConfig;
use patchflow_core::reliability::RetryPolicy;
use patchflow_core::reliability::STANDARD;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default configuration filename when no path is specified.
const DEFAULT_CONFIG_NAME: &str = "patchflow.toml";

/// Environment variable used to override the config path.
pub const CONFIG_ENV_VAR: &str = "PATCHFLOW_CONFIG";

/// Maximum configuration file size in bytes.
pub(crate) const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

/// Minimum webhook secret length in bytes.
pub(crate) const MIN_WEBHOOK_SECRET_LENGTH: usize = 16;

/// Ed25519 public key length in bytes.
pub(crate) const ED25519_KEY_LENGTH: usize = 32;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("config io error at {path}: {detail}")]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// Underlying failure.
        detail: String,
    },
    /// Config file exceeds the size limit.
    #[error("config file too large: {0} bytes")]
    TooLarge(u64),
    /// Config file failed to parse.
    #[error("config parse error: {0}")]
    Parse(String),
    /// A validation rule failed.
    #[error("config invalid: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Sections
// ============================================================================

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    /// Socket address the server binds.
    pub bind: SocketAddr,
    /// Maximum accepted request body size in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Default request body cap (1 MiB).
const fn default_max_body_bytes() -> usize {
    1024 * 1024
}

/// Lifecycle timeout settings, all in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutSection {
    /// Approval validity window.
    #[serde(default = "default_approval_ttl")]
    pub approval_ttl_millis: i64,
    /// Run lock duration per heartbeat.
    #[serde(default = "default_run_lock_ttl")]
    pub run_lock_ttl_millis: i64,
    /// Duplicate-fingerprint rejection window.
    #[serde(default = "default_dedup_window")]
    pub dedup_window_millis: i64,
}

/// Default approval TTL.
const fn default_approval_ttl() -> i64 {
    DEFAULT_APPROVAL_TTL_MILLIS
}

/// Default run lock TTL.
const fn default_run_lock_ttl() -> i64 {
    DEFAULT_RUN_LOCK_TTL_MILLIS
}

/// Default dedup window.
const fn default_dedup_window() -> i64 {
    10_000
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            approval_ttl_millis: default_approval_ttl(),
            run_lock_ttl_millis: default_run_lock_ttl(),
            dedup_window_millis: default_dedup_window(),
        }
    }
}

/// Named retry presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPreset {
    /// 3 attempts, 100ms base, 5s cap.
    Fast,
    /// 5 attempts, 500ms base, 30s cap.
    #[default]
    Standard,
    /// 8 attempts, 1s base, 2m cap.
    Patient,
}

impl RetryPreset {
    /// Returns the retry policy for the preset.
    #[must_use]
    pub const fn policy(self) -> RetryPolicy {
        match self {
            Self::Fast => FAST,
            Self::Standard => STANDARD,
            Self::Patient => PATIENT,
        }
    }
}

/// Rate limiter settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitSection {
    /// Admissions allowed per window.
    pub limit: u32,
    /// Window length in milliseconds.
    pub window_millis: i64,
}

impl RateLimitSection {
    /// Returns the kernel rate-limit config.
    #[must_use]
    pub const fn to_config(self) -> RateLimitConfig {
        RateLimitConfig {
            limit: self.limit,
            window_millis: self.window_millis,
        }
    }
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            limit: 60,
            window_millis: 60_000,
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerSection {
    /// Consecutive failures that trip a breaker.
    pub failure_threshold: u32,
    /// Optional failure-rate trip in `0.0..=1.0`.
    pub failure_rate_threshold: Option<f64>,
    /// Rolling window for rate accounting, in milliseconds.
    pub window_millis: i64,
    /// Open-state cooldown, in milliseconds.
    pub cooldown_millis: i64,
}

impl BreakerSection {
    /// Returns the kernel breaker config.
    #[must_use]
    pub const fn to_config(self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            failure_rate_threshold: self.failure_rate_threshold,
            window_millis: self.window_millis,
            cooldown_millis: self.cooldown_millis,
        }
    }
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: None,
            window_millis: 60_000,
            cooldown_millis: 30_000,
        }
    }
}

/// One approver identity trusted for a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApproverConfig {
    /// Approver identifier referenced by signed decisions.
    pub id: String,
    /// Base64-encoded Ed25519 public key.
    pub public_key: String,
    /// Capabilities the approver may authorize; empty means all
    /// destructive capabilities.
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

/// Per-tenant settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TenantConfig {
    /// Shared secret for webhook HMAC verification.
    pub webhook_secret: String,
    /// Approvers trusted to sign decisions for this tenant.
    #[serde(default)]
    pub approvers: Vec<ApproverConfig>,
}

// ============================================================================
// SECTION: Root Config
// ============================================================================

/// Root Patchflow configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatchflowConfig {
    /// HTTP server settings.
    pub server: ServerSection,
    /// Lifecycle timeouts.
    #[serde(default)]
    pub timeouts: TimeoutSection,
    /// Retry preset for outbound calls.
    #[serde(default)]
    pub retry: RetryPreset,
    /// Inbound rate limiter settings.
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    /// Circuit breaker settings.
    #[serde(default)]
    pub breaker: BreakerSection,
    /// Tenant registry keyed by tenant id.
    pub tenants: BTreeMap<String, TenantConfig>,
}

impl PatchflowConfig {
    /// Loads configuration from an explicit path, the environment
    /// override, or the default filename, in that order.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when reading, parsing, or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map_or_else(
            || {
                env::var(CONFIG_ENV_VAR)
                    .map_or_else(|_| PathBuf::from(DEFAULT_CONFIG_NAME), PathBuf::from)
            },
            Path::to_path_buf,
        );
        let metadata = fs::metadata(&path).map_err(|err| ConfigError::Io {
            path: path.clone(),
            detail: err.to_string(),
        })?;
        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::TooLarge(metadata.len()));
        }
        let raw = fs::read_to_string(&path).map_err(|err| ConfigError::Io {
            path: path.clone(),
            detail: err.to_string(),
        })?;
        Self::parse(&raw)
    }

    /// Parses and validates configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when parsing or validation fails.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field rules the type system cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first violated rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tenants.is_empty() {
            return Err(ConfigError::Invalid("at least one tenant is required".to_string()));
        }
        if self.rate_limit.limit == 0 {
            return Err(ConfigError::Invalid("rate_limit.limit must be positive".to_string()));
        }
        if self.rate_limit.window_millis <= 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.window_millis must be positive".to_string(),
            ));
        }
        if self.timeouts.approval_ttl_millis <= 0
            || self.timeouts.run_lock_ttl_millis <= 0
            || self.timeouts.dedup_window_millis <= 0
        {
            return Err(ConfigError::Invalid("timeouts must be positive".to_string()));
        }
        if let Some(rate) = self.breaker.failure_rate_threshold {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConfigError::Invalid(
                    "breaker.failure_rate_threshold must be within 0.0..=1.0".to_string(),
                ));
            }
        }

        for (tenant_id, tenant) in &self.tenants {
            if tenant.webhook_secret.len() < MIN_WEBHOOK_SECRET_LENGTH {
                return Err(ConfigError::Invalid(format!(
                    "tenant {tenant_id}: webhook secret is shorter than \
                     {MIN_WEBHOOK_SECRET_LENGTH} bytes"
                )));
            }
            for approver in &tenant.approvers {
                if approver.id.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "tenant {tenant_id}: approver id is empty"
                    )));
                }
                let decoded = BASE64.decode(&approver.public_key).map_err(|_| {
                    ConfigError::Invalid(format!(
                        "tenant {tenant_id}: approver {} key is not valid base64",
                        approver.id
                    ))
                })?;
                if decoded.len() != ED25519_KEY_LENGTH {
                    return Err(ConfigError::Invalid(format!(
                        "tenant {tenant_id}: approver {} key must decode to \
                         {ED25519_KEY_LENGTH} bytes",
                        approver.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Returns the engine config derived from the timeout section.
    #[must_use]
    pub const fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            dedup_window_millis: self.timeouts.dedup_window_millis,
        }
    }

    /// Returns the webhook secret for a tenant.
    #[must_use]
    pub fn webhook_secret(&self, tenant_id: &str) -> Option<&str> {
        self.tenants.get(tenant_id).map(|tenant| tenant.webhook_secret.as_str())
    }
}
