// crates/patchflow-http/tests/http.rs
// ============================================================================
// Module: HTTP Surface Tests
// Description: In-process router tests for webhook, run, and approval
//              endpoints.
// Purpose: Validate signatures, idempotent replay, status mapping, and
//          tenant scoping.
// Dependencies: http-body-util, patchflow-http, tower
// ============================================================================

//! ## Overview
//! Drives the axum router without sockets: webhook deliveries are verified
//! and deduplicated with byte-identical replay, missing headers map to the
//! documented status codes, approvals enforce hash binding over the wire,
//! and reads are tenant scoped.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    reason = "Test-only panic-based assertions are permitted."
)]

use std::sync::Arc;
use std::sync::Mutex;

use axum::Router;
use axum::body::Body;
use axum::http::Request;
use axum::http::StatusCode;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::Signer;
use ed25519_dalek::SigningKey;
use http_body_util::BodyExt;
use patchflow_config::PatchflowConfig;
use patchflow_core::ApprovalDecision;
use patchflow_core::ApproverId;
use patchflow_core::Capability;
use patchflow_core::Clock;
use patchflow_core::DecisionPayload;
use patchflow_core::DocumentStore;
use patchflow_core::HostMutation;
use patchflow_core::MemoryStore;
use patchflow_core::NoopEventBus;
use patchflow_core::RunStatus;
use patchflow_core::SharedBus;
use patchflow_core::SharedStore;
use patchflow_core::SignedDecision;
use patchflow_core::TenantId;
use patchflow_core::Timestamp;
use patchflow_core::TriggerOrigin;
use patchflow_core::WorkflowKind;
use patchflow_core::canonical_json_bytes;
use patchflow_core::hash_bytes;
use patchflow_core::hash_canonical_json;
use patchflow_http::HEADER_DELIVERY_ID;
use patchflow_http::HEADER_IDEMPOTENCY_KEY;
use patchflow_http::HEADER_REPLAY;
use patchflow_http::HEADER_SIGNATURE;
use patchflow_http::HEADER_TENANT;
use patchflow_http::NoopAuditSink;
use patchflow_http::ServerState;
use patchflow_http::router;
use patchflow_http::sign_body;
use rand::SeedableRng;
use tower::ServiceExt;

/// Test tenant id.
const TENANT: &str = "acme";

/// Test webhook secret.
const SECRET: &str = "super-secret-webhook-key";

/// Base test time.
const T0: i64 = 1_700_000_000_000;

/// Manually advanced clock shared with the server.
#[derive(Debug, Clone)]
struct ManualClock {
    /// Current time in unix milliseconds.
    now: Arc<Mutex<i64>>,
}

impl ManualClock {
    /// Creates a clock at the given time.
    fn at(millis: i64) -> Self {
        Self {
            now: Arc::new(Mutex::new(millis)),
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_unix_millis(self.now.lock().map_or(0, |now| *now))
    }
}

/// Returns the approver signing key.
fn approver_key() -> SigningKey {
    SigningKey::from_bytes(&[1; 32])
}

/// Builds the server state and router over a fresh store.
fn test_router() -> (Router, Arc<ServerState>) {
    let key = BASE64.encode(approver_key().verifying_key().to_bytes());
    let raw = format!(
        r#"
[server]
bind = "127.0.0.1:0"

[tenants.{TENANT}]
webhook_secret = "{SECRET}"

[[tenants.{TENANT}.approvers]]
id = "alice"
public_key = "{key}"
"#
    );
    let config = PatchflowConfig::parse(&raw).expect("config");
    let state = Arc::new(
        ServerState::new(
            config,
            SharedStore::from_store(MemoryStore::new()),
            SharedBus::from_bus(NoopEventBus),
            Arc::new(ManualClock::at(T0)),
            Arc::new(NoopAuditSink),
            5,
        )
        .expect("state"),
    );
    (router(Arc::clone(&state)), state)
}

/// Sends one request and returns `(status, replay-marker, body)`.
async fn send(
    router: &Router,
    request: Request<Body>,
) -> (StatusCode, bool, String) {
    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let replayed = response.headers().contains_key(HEADER_REPLAY);
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    (status, replayed, String::from_utf8_lossy(&bytes).to_string())
}

/// Builds a signed webhook request.
fn webhook_request(body: &str, delivery_id: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/webhook")
        .header(HEADER_TENANT, TENANT)
        .header(HEADER_DELIVERY_ID, delivery_id)
        .header(HEADER_SIGNATURE, sign_body(SECRET, body.as_bytes()))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

/// Verifies the duplicate-delivery scenario: the second identical delivery
/// replays the identical body and exactly one run exists.
#[tokio::test]
async fn duplicate_webhook_replays_identical_response() {
    let (router, state) = test_router();
    let body = r#"{"repository":"octo/widgets","pr_number":41}"#;

    let (status, replayed, first) = send(&router, webhook_request(body, "D-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!replayed);
    let first_json: serde_json::Value = serde_json::from_str(&first).expect("json");
    assert_eq!(first_json["status"], "triggered");
    let run_id = first_json["run_id"].as_str().expect("run id").to_string();

    let (status, replayed, second) = send(&router, webhook_request(body, "D-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(replayed);
    assert_eq!(first, second);

    // Exactly one run exists for the tenant.
    let now = Timestamp::from_unix_millis(T0 + 1_000);
    let runs = state
        .engine()
        .store()
        .query(
            patchflow_core::Collection::Runs,
            &patchflow_core::DocumentQuery::RunsByTenantStatus {
                tenant_id: TenantId::new(TENANT),
                status: None,
                created_from: None,
                created_to: None,
            },
            now,
        )
        .expect("query");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, run_id);
}

/// Verifies the same body under a fresh delivery id inside the dedup
/// window reports `duplicate` with the existing run.
#[tokio::test]
async fn same_body_new_delivery_id_reports_duplicate_run() {
    let (router, _state) = test_router();
    let body = r#"{"repository":"octo/widgets","pr_number":41}"#;

    let (_status, _replayed, first) = send(&router, webhook_request(body, "D-1")).await;
    let first_json: serde_json::Value = serde_json::from_str(&first).expect("json");
    let run_id = first_json["run_id"].as_str().expect("run id").to_string();

    let (status, replayed, second) = send(&router, webhook_request(body, "D-2")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!replayed);
    let second_json: serde_json::Value = serde_json::from_str(&second).expect("json");
    assert_eq!(second_json["status"], "duplicate");
    assert_eq!(second_json["run_id"], run_id.as_str());
}

/// Verifies a missing delivery id maps to 400.
#[tokio::test]
async fn missing_delivery_id_is_bad_request() {
    let (router, _state) = test_router();
    let body = r#"{"repository":"octo/widgets"}"#;
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header(HEADER_TENANT, TENANT)
        .header(HEADER_SIGNATURE, sign_body(SECRET, body.as_bytes()))
        .body(Body::from(body))
        .expect("request");
    let (status, _replayed, payload) = send(&router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(payload.contains("missing_delivery_id"));
    assert!(payload.contains("correlationId"));
}

/// Verifies a bad signature maps to 401 and never creates a run.
#[tokio::test]
async fn bad_signature_is_unauthorized() {
    let (router, state) = test_router();
    let body = r#"{"repository":"octo/widgets"}"#;
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header(HEADER_TENANT, TENANT)
        .header(HEADER_DELIVERY_ID, "D-2")
        .header(HEADER_SIGNATURE, "sha256=deadbeef")
        .body(Body::from(body))
        .expect("request");
    let (status, _replayed, _payload) = send(&router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let runs = state
        .engine()
        .store()
        .query(
            patchflow_core::Collection::Runs,
            &patchflow_core::DocumentQuery::RunsByTenantStatus {
                tenant_id: TenantId::new(TENANT),
                status: None,
                created_from: None,
                created_to: None,
            },
            Timestamp::from_unix_millis(T0 + 1),
        )
        .expect("query");
    assert!(runs.is_empty());
}

/// Verifies run creation requires an idempotency key and replays on the
/// same key.
#[tokio::test]
async fn run_creation_replays_on_idempotency_key() {
    let (router, _state) = test_router();
    let body = r#"{"workflow":"issue-to-code","repository":"octo/widgets","issue_number":7}"#;

    let bare = Request::builder()
        .method("POST")
        .uri("/runs")
        .header(HEADER_TENANT, TENANT)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .expect("request");
    let (status, _replayed, _payload) = send(&router, bare).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let keyed = |key: &'static str| {
        Request::builder()
            .method("POST")
            .uri("/runs")
            .header(HEADER_TENANT, TENANT)
            .header(HEADER_IDEMPOTENCY_KEY, key)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .expect("request")
    };
    let (status, replayed, first) = send(&router, keyed("req-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!replayed);

    let (status, replayed, second) = send(&router, keyed("req-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(replayed);
    assert_eq!(first, second);

    // A different key creates a distinct run.
    let (status, replayed, third) = send(&router, keyed("req-2")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!replayed);
    assert_ne!(first, third);
}

/// Parks an autopilot run behind a pending approval directly through the
/// core services.
fn park_run(state: &Arc<ServerState>) -> (patchflow_core::RunId, HostMutation) {
    let now = Timestamp::from_unix_millis(T0);
    let mut rng = rand::rngs::StdRng::seed_from_u64(9);
    let run = state
        .engine()
        .create_run(
            patchflow_core::CreateRun {
                tenant_id: TenantId::new(TENANT),
                workflow: WorkflowKind::Autopilot,
                trigger: TriggerOrigin::Api,
                target: patchflow_core::TargetDescriptor {
                    repository: "octo/widgets".to_string(),
                    pr_number: Some(41),
                    issue_number: None,
                },
                input_fingerprint: hash_canonical_json(&"seed").expect("hash"),
            },
            now,
            &mut rng,
        )
        .expect("run");
    state
        .engine()
        .transition_run(&run.run_id, RunStatus::Running, None, None, now)
        .expect("start");
    let mutation = HostMutation {
        capability: Capability::Merge,
        target: run.target.clone(),
        payload: b"{\"base\":\"main\",\"head\":\"fix\"}".to_vec(),
        content_type: "application/json".to_string(),
    };
    state.gate().request_approval(&run, &mutation, now, &mut rng).expect("request");
    state
        .engine()
        .transition_run(&run.run_id, RunStatus::AwaitingApproval, None, None, now)
        .expect("park");
    (run.run_id, mutation)
}

/// Builds the signed decision body for a payload.
fn decision_body(payload: DecisionPayload) -> String {
    let message = canonical_json_bytes(&payload).expect("canonical bytes");
    let signature = approver_key().sign(&message);
    let decision = SignedDecision {
        payload,
        approver: ApproverId::new("alice"),
        signature: BASE64.encode(signature.to_bytes()),
        reason: None,
    };
    serde_json::to_string(&decision).expect("decision json")
}

/// Verifies a valid signed approval unblocks the run over the wire.
#[tokio::test]
async fn approval_endpoint_unblocks_run() {
    let (router, state) = test_router();
    let (run_id, mutation) = park_run(&state);

    let payload = DecisionPayload {
        run_id: run_id.clone(),
        capability: Capability::Merge,
        target: mutation.target.clone(),
        artifact_hash: hash_bytes(&mutation.payload),
        decision: ApprovalDecision::Approve,
        signed_at: Timestamp::from_unix_millis(T0 + 100),
    };
    let request = Request::builder()
        .method("POST")
        .uri(format!("/runs/{}/approve", run_id.as_str()))
        .header(HEADER_TENANT, TENANT)
        .header("content-type", "application/json")
        .body(Body::from(decision_body(payload)))
        .expect("request");
    let (status, _replayed, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("approved"));

    let run = state
        .engine()
        .get_run(&run_id, Timestamp::from_unix_millis(T0 + 200))
        .expect("reload");
    assert_eq!(run.status, RunStatus::Running);
}

/// Verifies a hash mismatch maps to 409 and the run stays parked.
#[tokio::test]
async fn approval_hash_mismatch_is_conflict() {
    let (router, state) = test_router();
    let (run_id, mutation) = park_run(&state);

    let payload = DecisionPayload {
        run_id: run_id.clone(),
        capability: Capability::Merge,
        target: mutation.target.clone(),
        artifact_hash: hash_bytes(b"tampered payload"),
        decision: ApprovalDecision::Approve,
        signed_at: Timestamp::from_unix_millis(T0 + 100),
    };
    let request = Request::builder()
        .method("POST")
        .uri(format!("/runs/{}/approve", run_id.as_str()))
        .header(HEADER_TENANT, TENANT)
        .header("content-type", "application/json")
        .body(Body::from(decision_body(payload)))
        .expect("request");
    let (status, _replayed, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body.contains("hash_mismatch"));

    let run = state
        .engine()
        .get_run(&run_id, Timestamp::from_unix_millis(T0 + 200))
        .expect("reload");
    assert_eq!(run.status, RunStatus::AwaitingApproval);
}

/// Verifies reads are tenant scoped: a foreign tenant reads not-found.
#[tokio::test]
async fn reads_are_tenant_scoped() {
    let (router, state) = test_router();
    let (run_id, _mutation) = park_run(&state);

    let request = Request::builder()
        .method("GET")
        .uri(format!("/runs/{}", run_id.as_str()))
        .header(HEADER_TENANT, TENANT)
        .body(Body::empty())
        .expect("request");
    let (status, _replayed, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("awaiting_approval"));

    // An unregistered tenant header fails validation outright.
    let foreign = Request::builder()
        .method("GET")
        .uri(format!("/runs/{}", run_id.as_str()))
        .header(HEADER_TENANT, "ghost")
        .body(Body::empty())
        .expect("request");
    let (status, _replayed, _body) = send(&router, foreign).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
