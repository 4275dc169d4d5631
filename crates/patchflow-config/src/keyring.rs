// crates/patchflow-config/src/keyring.rs
// ============================================================================
// Module: Patchflow Static Keyring
// Description: Approver key registry built from validated configuration.
// Purpose: Provide the gate's trust anchor from the tenant registry.
// Dependencies: ed25519-dalek, patchflow-core
// ============================================================================

//! ## Overview
//! The static keyring materializes the per-tenant approver entries of the
//! validated config into parsed Ed25519 verification keys. Lookups fail
//! closed: an unknown tenant, unknown approver, or capability outside the
//! approver's grant yields no key or a denied authorization.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::VerifyingKey;
use patchflow_core::ApproverId;
use patchflow_core::ApproverKeyring;
use patchflow_core::Capability;
use patchflow_core::TenantId;

use crate::config::ConfigError;
use crate::config::PatchflowConfig;

// ============================================================================
// SECTION: Entries
// ============================================================================

/// One trusted approver with its parsed key and capability grant.
#[derive(Debug, Clone)]
struct KeyringEntry {
    /// Parsed verification key.
    key: VerifyingKey,
    /// Granted capabilities; empty means all destructive capabilities.
    capabilities: Vec<Capability>,
}

// ============================================================================
// SECTION: Static Keyring
// ============================================================================

/// Approver keyring backed by validated configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticKeyring {
    /// Entries keyed by `(tenant, approver)`.
    entries: BTreeMap<(String, String), KeyringEntry>,
}

impl StaticKeyring {
    /// Builds the keyring from a validated config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a key fails to decode; the
    /// config validation should have caught this earlier, so a failure here
    /// indicates the config changed after validation.
    pub fn from_config(config: &PatchflowConfig) -> Result<Self, ConfigError> {
        let mut entries = BTreeMap::new();
        for (tenant_id, tenant) in &config.tenants {
            for approver in &tenant.approvers {
                let decoded = BASE64.decode(&approver.public_key).map_err(|_| {
                    ConfigError::Invalid(format!(
                        "approver {} key is not valid base64",
                        approver.id
                    ))
                })?;
                let bytes: [u8; 32] = decoded.try_into().map_err(|_| {
                    ConfigError::Invalid(format!(
                        "approver {} key must decode to 32 bytes",
                        approver.id
                    ))
                })?;
                let key = VerifyingKey::from_bytes(&bytes).map_err(|_| {
                    ConfigError::Invalid(format!(
                        "approver {} key is not a valid ed25519 point",
                        approver.id
                    ))
                })?;
                entries.insert(
                    (tenant_id.clone(), approver.id.clone()),
                    KeyringEntry {
                        key,
                        capabilities: approver.capabilities.clone(),
                    },
                );
            }
        }
        Ok(Self {
            entries,
        })
    }

    /// Looks up the entry for a tenant-scoped approver.
    fn entry(&self, tenant_id: &TenantId, approver: &ApproverId) -> Option<&KeyringEntry> {
        self.entries.get(&(tenant_id.as_str().to_string(), approver.as_str().to_string()))
    }
}

impl ApproverKeyring for StaticKeyring {
    fn verification_key(
        &self,
        tenant_id: &TenantId,
        approver: &ApproverId,
    ) -> Option<VerifyingKey> {
        self.entry(tenant_id, approver).map(|entry| entry.key)
    }

    fn is_authorized(
        &self,
        tenant_id: &TenantId,
        approver: &ApproverId,
        capability: Capability,
    ) -> bool {
        self.entry(tenant_id, approver).is_some_and(|entry| {
            entry.capabilities.is_empty() || entry.capabilities.contains(&capability)
        })
    }
}
