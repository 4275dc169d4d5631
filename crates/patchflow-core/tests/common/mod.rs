// crates/patchflow-core/tests/common/mod.rs
// ============================================================================
// Module: Shared Test Fixtures
// Description: Deterministic ports and builders for core integration tests.
// Purpose: Keep clocks, buses, models, and keyrings consistent across suites.
// Dependencies: ed25519-dalek, patchflow-core, rand
// ============================================================================

//! ## Overview
//! Fixtures inject every port the core needs: a manual clock, an instant
//! sleeper that records delays, a recording bus, programmable model and
//! connector stubs, and a keyring with freshly derived Ed25519 keys.

#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Each test suite uses the subset of fixtures it needs; \
              panic-based assertions are permitted in test support code."
)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::Signer;
use ed25519_dalek::SigningKey;
use ed25519_dalek::VerifyingKey;
use patchflow_core::ApproverId;
use patchflow_core::ApproverKeyring;
use patchflow_core::BusError;
use patchflow_core::BusEvent;
use patchflow_core::Capability;
use patchflow_core::CapabilityError;
use patchflow_core::Clock;
use patchflow_core::ConnectorError;
use patchflow_core::CreateRun;
use patchflow_core::DecisionPayload;
use patchflow_core::DispatchReceipt;
use patchflow_core::EngineConfig;
use patchflow_core::EventBus;
use patchflow_core::HashDigest;
use patchflow_core::HostConnector;
use patchflow_core::HostMutation;
use patchflow_core::MemoryStore;
use patchflow_core::ModelCapability;
use patchflow_core::ModelRequest;
use patchflow_core::ModelResponse;
use patchflow_core::Run;
use patchflow_core::RunStateEngine;
use patchflow_core::SignedDecision;
use patchflow_core::Sleeper;
use patchflow_core::StageKind;
use patchflow_core::TargetDescriptor;
use patchflow_core::TenantId;
use patchflow_core::Timestamp;
use patchflow_core::TriggerOrigin;
use patchflow_core::WorkflowKind;
use patchflow_core::canonical_json_bytes;
use patchflow_core::hash_canonical_json;
use patchflow_core::pipeline::StageOutput;
use rand::SeedableRng;
use rand::rngs::StdRng;

// ============================================================================
// SECTION: Clock and Sleeper
// ============================================================================

/// Manually advanced clock.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    /// Current time in unix milliseconds.
    now: Arc<Mutex<i64>>,
}

impl ManualClock {
    /// Creates a clock at the given time.
    pub fn at(millis: i64) -> Self {
        Self {
            now: Arc::new(Mutex::new(millis)),
        }
    }

    /// Advances the clock.
    pub fn advance(&self, millis: i64) {
        if let Ok(mut now) = self.now.lock() {
            *now += millis;
        }
    }

    /// Sets the clock to an absolute time.
    pub fn set(&self, millis: i64) {
        if let Ok(mut now) = self.now.lock() {
            *now = millis;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_unix_millis(self.now.lock().map_or(0, |now| *now))
    }
}

/// Sleeper that records requested delays without sleeping.
#[derive(Debug, Clone, Default)]
pub struct InstantSleeper {
    /// Recorded delays in milliseconds.
    pub delays: Arc<Mutex<Vec<u64>>>,
}

impl InstantSleeper {
    /// Returns the recorded delays.
    pub fn recorded(&self) -> Vec<u64> {
        self.delays.lock().map_or_else(|_| Vec::new(), |delays| delays.clone())
    }
}

impl Sleeper for InstantSleeper {
    fn sleep_millis(&self, millis: u64) {
        if let Ok(mut delays) = self.delays.lock() {
            delays.push(millis);
        }
    }
}

// ============================================================================
// SECTION: Recording Bus
// ============================================================================

/// Bus that records every published event.
#[derive(Debug, Clone, Default)]
pub struct RecordingBus {
    /// Published events in order.
    pub events: Arc<Mutex<Vec<BusEvent>>>,
}

impl RecordingBus {
    /// Returns the recorded events.
    pub fn recorded(&self) -> Vec<BusEvent> {
        self.events.lock().map_or_else(|_| Vec::new(), |events| events.clone())
    }

    /// Returns the recorded topics in order.
    pub fn topics(&self) -> Vec<&'static str> {
        self.recorded().iter().map(BusEvent::topic).collect()
    }
}

impl EventBus for RecordingBus {
    fn publish(&self, event: &BusEvent) -> Result<(), BusError> {
        self.events
            .lock()
            .map_err(|_| BusError::Publish("bus mutex poisoned".to_string()))?
            .push(event.clone());
        Ok(())
    }
}

// ============================================================================
// SECTION: Keyring
// ============================================================================

/// Keyring with in-memory approver keys.
#[derive(Debug, Clone, Default)]
pub struct TestKeyring {
    /// Verification keys by `(tenant, approver)`.
    keys: BTreeMap<(String, String), VerifyingKey>,
    /// Capability grants by `(tenant, approver)`; empty means all.
    grants: BTreeMap<(String, String), Vec<Capability>>,
}

impl TestKeyring {
    /// Registers an approver with an unrestricted grant.
    pub fn register(&mut self, tenant: &str, approver: &str, key: VerifyingKey) {
        self.keys.insert((tenant.to_string(), approver.to_string()), key);
        self.grants.insert((tenant.to_string(), approver.to_string()), Vec::new());
    }

    /// Registers an approver limited to specific capabilities.
    pub fn register_scoped(
        &mut self,
        tenant: &str,
        approver: &str,
        key: VerifyingKey,
        capabilities: Vec<Capability>,
    ) {
        self.keys.insert((tenant.to_string(), approver.to_string()), key);
        self.grants.insert((tenant.to_string(), approver.to_string()), capabilities);
    }
}

impl ApproverKeyring for TestKeyring {
    fn verification_key(
        &self,
        tenant_id: &TenantId,
        approver: &ApproverId,
    ) -> Option<VerifyingKey> {
        self.keys
            .get(&(tenant_id.as_str().to_string(), approver.as_str().to_string()))
            .copied()
    }

    fn is_authorized(
        &self,
        tenant_id: &TenantId,
        approver: &ApproverId,
        capability: Capability,
    ) -> bool {
        self.grants
            .get(&(tenant_id.as_str().to_string(), approver.as_str().to_string()))
            .is_some_and(|grant| grant.is_empty() || grant.contains(&capability))
    }
}

/// Creates a deterministic signing key for tests.
pub fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

/// Signs a decision payload the way an approver client would.
pub fn sign_decision(
    key: &SigningKey,
    payload: DecisionPayload,
    approver: &str,
    reason: Option<String>,
) -> SignedDecision {
    let message = canonical_json_bytes(&payload).expect("canonical payload bytes");
    let signature = key.sign(&message);
    SignedDecision {
        payload,
        approver: ApproverId::new(approver),
        signature: BASE64.encode(signature.to_bytes()),
        reason,
    }
}

// ============================================================================
// SECTION: Model Stub
// ============================================================================

/// Scripted behavior for one model invocation.
#[derive(Debug, Clone)]
pub enum ModelScript {
    /// Return this stage output as JSON.
    Output(StageOutput),
    /// Return raw content, valid or not.
    Raw(String),
    /// Fail with a transient error.
    Unavailable,
    /// Fail with a timeout.
    Timeout,
}

/// Programmable model capability.
#[derive(Debug, Default)]
pub struct StubModel {
    /// Scripts keyed by stage, consumed front to back.
    scripts: Mutex<BTreeMap<StageKind, Vec<ModelScript>>>,
    /// Count of invocations per stage.
    pub calls: Mutex<BTreeMap<StageKind, u32>>,
}

impl StubModel {
    /// Creates an empty stub; unscripted stages fail closed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one scripted behavior for a stage.
    pub fn script(&self, stage: StageKind, script: ModelScript) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.entry(stage).or_default().push(script);
        }
    }

    /// Queues a successful typed output for a stage.
    pub fn script_output(&self, stage: StageKind, output: StageOutput) {
        self.script(stage, ModelScript::Output(output));
    }

    /// Returns how many times a stage was invoked.
    pub fn call_count(&self, stage: StageKind) -> u32 {
        self.calls.lock().map_or(0, |calls| calls.get(&stage).copied().unwrap_or(0))
    }
}

impl ModelCapability for StubModel {
    fn invoke(&self, request: &ModelRequest) -> Result<ModelResponse, CapabilityError> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(request.stage).or_insert(0) += 1;
        }
        let script = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut scripts| {
                scripts.get_mut(&request.stage).and_then(|queue| {
                    if queue.is_empty() {
                        None
                    } else {
                        Some(queue.remove(0))
                    }
                })
            })
            .ok_or_else(|| {
                CapabilityError::Rejected(format!("no script for {:?}", request.stage))
            })?;
        match script {
            ModelScript::Output(output) => Ok(ModelResponse {
                content: serde_json::to_string(&output)
                    .map_err(|err| CapabilityError::Rejected(err.to_string()))?,
            }),
            ModelScript::Raw(content) => Ok(ModelResponse {
                content,
            }),
            ModelScript::Unavailable => {
                Err(CapabilityError::Unavailable("stub outage".to_string()))
            }
            ModelScript::Timeout => Err(CapabilityError::Timeout),
        }
    }
}

// ============================================================================
// SECTION: Connector Stub
// ============================================================================

/// Recording host connector.
#[derive(Debug, Default)]
pub struct StubConnector {
    /// Dispatched mutations in order.
    pub dispatched: Mutex<Vec<HostMutation>>,
    /// Failures to inject before succeeding.
    pub failures_remaining: Mutex<u32>,
}

impl StubConnector {
    /// Creates a connector that always succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Injects transient failures before the next success.
    pub fn fail_times(&self, failures: u32) {
        if let Ok(mut remaining) = self.failures_remaining.lock() {
            *remaining = failures;
        }
    }

    /// Returns the dispatched mutations.
    pub fn recorded(&self) -> Vec<HostMutation> {
        self.dispatched.lock().map_or_else(|_| Vec::new(), |mutations| mutations.clone())
    }
}

impl HostConnector for StubConnector {
    fn dispatch(&self, mutation: &HostMutation) -> Result<DispatchReceipt, ConnectorError> {
        if let Ok(mut remaining) = self.failures_remaining.lock() {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ConnectorError::Unreachable("stub outage".to_string()));
            }
        }
        let ordinal = self
            .dispatched
            .lock()
            .map_err(|_| ConnectorError::Rejected("mutex poisoned".to_string()))
            .map(|mut dispatched| {
                dispatched.push(mutation.clone());
                dispatched.len()
            })?;
        Ok(DispatchReceipt {
            receipt_id: format!("receipt-{ordinal}"),
            detail: None,
        })
    }
}

// ============================================================================
// SECTION: Builders
// ============================================================================

/// Default test tenant.
pub const TENANT: &str = "tenant-a";

/// Returns a deterministic rng for id minting.
pub fn test_rng() -> StdRng {
    StdRng::seed_from_u64(7)
}

/// Builds an engine over a fresh in-memory store and recording bus.
pub fn engine_fixture() -> (RunStateEngine<MemoryStore, RecordingBus>, MemoryStore, RecordingBus)
{
    let store = MemoryStore::new();
    let bus = RecordingBus::default();
    let engine = RunStateEngine::new(store.clone(), bus.clone(), EngineConfig::default());
    (engine, store, bus)
}

/// Builds a create-run request for the default tenant.
pub fn create_request(workflow: WorkflowKind, trigger: TriggerOrigin, salt: &str) -> CreateRun {
    CreateRun {
        tenant_id: TenantId::new(TENANT),
        workflow,
        trigger,
        target: TargetDescriptor {
            repository: "octo/widgets".to_string(),
            pr_number: Some(41),
            issue_number: None,
        },
        input_fingerprint: fingerprint(salt),
    }
}

/// Hashes a salt into a deterministic input fingerprint.
pub fn fingerprint(salt: &str) -> HashDigest {
    hash_canonical_json(&serde_json::json!({ "salt": salt })).expect("fingerprint hash")
}

/// Creates a run and returns it.
pub fn spawn_run(
    engine: &RunStateEngine<MemoryStore, RecordingBus>,
    workflow: WorkflowKind,
    trigger: TriggerOrigin,
    salt: &str,
    now: Timestamp,
) -> Run {
    engine
        .create_run(create_request(workflow, trigger, salt), now, &mut test_rng())
        .expect("create run")
}
