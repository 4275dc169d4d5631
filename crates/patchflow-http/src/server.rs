// crates/patchflow-http/src/server.rs
// ============================================================================
// Module: Patchflow HTTP Server
// Description: Inbound HTTP surface over the core run substrate.
// Purpose: Expose webhook intake, run mutations, approvals, and reads.
// Dependencies: axum, patchflow-config, patchflow-core, tokio
// ============================================================================

//! ## Overview
//! Every inbound route follows the same spine: authenticate, rate limit,
//! wrap in the idempotency gate, execute against the core, finalize with
//! the cacheable response. Duplicate events replay their recorded bytes
//! with a replay marker header. Errors map to stable status codes and a
//! structured `{code, message, retryable, correlationId}` body; stack
//! traces never reach clients.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::body::Bytes;
use axum::extract::DefaultBodyLimit;
use axum::extract::Path;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use patchflow_config::PatchflowConfig;
use patchflow_config::StaticKeyring;
use patchflow_core::ApprovalDecision;
use patchflow_core::ApprovalStatus;
use patchflow_core::AuditEventKind;
use patchflow_core::BeginOutcome;
use patchflow_core::CachedResponse;
use patchflow_core::Clock;
use patchflow_core::CoreError;
use patchflow_core::CreateRun;
use patchflow_core::EngineError;
use patchflow_core::ErrorKind;
use patchflow_core::IdempotencyConfig;
use patchflow_core::IdempotencyGate;
use patchflow_core::RunId;
use patchflow_core::RunStateEngine;
use patchflow_core::RunStatus;
use patchflow_core::SharedBus;
use patchflow_core::SharedStore;
use patchflow_core::SignedDecision;
use patchflow_core::TargetDescriptor;
use patchflow_core::TenantId;
use patchflow_core::Timestamp;
use patchflow_core::TriggerOrigin;
use patchflow_core::WorkflowKind;
use patchflow_core::gate::ApprovalGate;
use patchflow_core::gate::GateError;
use patchflow_core::hash_canonical_json;
use patchflow_core::core::idempotency::api_key;
use patchflow_core::core::idempotency::webhook_key;
use patchflow_core::ledger;
use patchflow_core::reliability::InMemoryRateLimitStore;
use patchflow_core::reliability::SlidingWindowLimiter;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::audit::HttpAuditEvent;
use crate::audit::HttpAuditSink;
use crate::audit::RequestOutcome;
use crate::auth::verify_signature;

// ============================================================================
// SECTION: Header Names
// ============================================================================

/// Tenant identifier header.
pub const HEADER_TENANT: &str = "x-patchflow-tenant";

/// Host-delivered unique delivery id header.
pub const HEADER_DELIVERY_ID: &str = "x-delivery-id";

/// Webhook HMAC signature header, `sha256=<hex>`.
pub const HEADER_SIGNATURE: &str = "x-webhook-signature";

/// Client-supplied idempotency key header.
pub const HEADER_IDEMPOTENCY_KEY: &str = "x-idempotency-key";

/// Fallback request id header.
pub const HEADER_REQUEST_ID: &str = "x-request-id";

/// Client identifier header scoping API idempotency keys.
pub const HEADER_CLIENT_ID: &str = "x-client-id";

/// Marker header set when a cached response is replayed.
pub const HEADER_REPLAY: &str = "x-idempotent-replay";

/// Correlation id header echoed on errors.
pub const HEADER_CORRELATION: &str = "x-correlation-id";

/// Interval between approval expiry sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// SECTION: Server State
// ============================================================================

/// Shared state behind every handler.
pub struct ServerState {
    /// Validated configuration.
    config: PatchflowConfig,
    /// Run state engine.
    engine: RunStateEngine<SharedStore, SharedBus>,
    /// Approval gate.
    gate: ApprovalGate<SharedStore, SharedBus, StaticKeyring>,
    /// Inbound idempotency gate.
    idempotency: IdempotencyGate<SharedStore>,
    /// Inbound per-tenant rate limiter.
    limiter: SlidingWindowLimiter<InMemoryRateLimitStore>,
    /// Clock port.
    clock: Arc<dyn Clock>,
    /// Request audit sink.
    audit: Arc<dyn HttpAuditSink>,
    /// Seeded id-minting randomness.
    rng: Mutex<StdRng>,
}

impl ServerState {
    /// Builds server state from validated configuration and ports.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Init`] when the keyring cannot be built.
    pub fn new(
        config: PatchflowConfig,
        store: SharedStore,
        bus: SharedBus,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn HttpAuditSink>,
        rng_seed: u64,
    ) -> Result<Self, ServerError> {
        let keyring = StaticKeyring::from_config(&config)
            .map_err(|err| ServerError::Init(err.to_string()))?;
        let engine = RunStateEngine::new(store.clone(), bus, config.engine_config());
        let gate = ApprovalGate::new(
            engine.clone(),
            keyring,
            config.timeouts.approval_ttl_millis,
        );
        let idempotency = IdempotencyGate::new(store, IdempotencyConfig::default());
        let limiter = SlidingWindowLimiter::new(
            InMemoryRateLimitStore::new(),
            config.rate_limit.to_config(),
        );
        Ok(Self {
            config,
            engine,
            gate,
            idempotency,
            limiter,
            clock,
            audit,
            rng: Mutex::new(StdRng::seed_from_u64(rng_seed)),
        })
    }

    /// Returns the engine for embedders and tests.
    #[must_use]
    pub const fn engine(&self) -> &RunStateEngine<SharedStore, SharedBus> {
        &self.engine
    }

    /// Returns the gate for embedders and tests.
    #[must_use]
    pub const fn gate(&self) -> &ApprovalGate<SharedStore, SharedBus, StaticKeyring> {
        &self.gate
    }

    /// Mints a correlation id.
    fn correlation_id(&self) -> String {
        let now = self.clock.now();
        self.rng.lock().map_or_else(
            |_| format!("corr-{now}"),
            |mut rng| {
                let suffix: u32 = rng.gen_range(0..u32::MAX);
                format!("corr-{now}-{suffix:08x}")
            },
        )
    }
}

// ============================================================================
// SECTION: Server Errors
// ============================================================================

/// Server construction and serve errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// State initialization failed.
    #[error("server init failed: {0}")]
    Init(String),
    /// Binding or serving failed.
    #[error("server io error: {0}")]
    Io(String),
}

// ============================================================================
// SECTION: Wire Shapes
// ============================================================================

/// Webhook event body after JSON parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct WebhookEventBody {
    /// Workflow to route; defaults to triage.
    #[serde(default)]
    workflow: Option<WorkflowKind>,
    /// Target repository in `owner/name` form.
    repository: String,
    /// Pull request number when the event targets a PR.
    #[serde(default)]
    pr_number: Option<u64>,
    /// Issue number when the event targets an issue.
    #[serde(default)]
    issue_number: Option<u64>,
}

/// Run creation request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CreateRunBody {
    /// Workflow to route.
    workflow: WorkflowKind,
    /// Target repository in `owner/name` form.
    repository: String,
    /// Pull request number when the run targets a PR.
    #[serde(default)]
    pr_number: Option<u64>,
    /// Issue number when the run targets an issue.
    #[serde(default)]
    issue_number: Option<u64>,
}

/// Webhook intake response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct WebhookResponse {
    /// `triggered`, `duplicate`, or `processing`.
    status: String,
    /// Run covering the delivery, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<String>,
}

/// Run mutation response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RunCreatedResponse {
    /// Created run identifier.
    run_id: String,
    /// Run status after creation.
    status: RunStatus,
}

/// Approval decision response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DecisionResponse {
    /// Approval status after the decision.
    status: String,
}

/// Structured error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ErrorBody {
    /// Stable machine-readable code.
    code: String,
    /// Human-readable message.
    message: String,
    /// Whether the client may retry.
    retryable: bool,
    /// Correlation identifier for support.
    #[serde(rename = "correlationId")]
    correlation_id: String,
}

// ============================================================================
// SECTION: Error Mapping
// ============================================================================

/// Maps an error kind to its stable HTTP status.
fn status_for(kind: ErrorKind, code: &str) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::PolicyDenied => match code {
            "rate_limited" => StatusCode::TOO_MANY_REQUESTS,
            "signature_invalid" | "missing_signature" => StatusCode::UNAUTHORIZED,
            _ => StatusCode::FORBIDDEN,
        },
        ErrorKind::ApprovalRequired | ErrorKind::ApprovalInvalid | ErrorKind::LockConflict => {
            StatusCode::CONFLICT
        }
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Transient => StatusCode::BAD_GATEWAY,
        ErrorKind::Permanent => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Builds the error response for a core error.
fn error_response(error: &CoreError, correlation_id: String) -> Response {
    let status = status_for(error.kind, &error.code);
    let body = ErrorBody {
        code: error.code.clone(),
        message: error.message.clone(),
        retryable: error.retryable,
        correlation_id: correlation_id.clone(),
    };
    let payload = serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string());
    json_response(status, payload, &[(HEADER_CORRELATION, correlation_id.as_str())])
}

/// Builds a JSON response with extra headers.
fn json_response(status: StatusCode, body: String, headers: &[(&str, &str)]) -> Response {
    let mut builder = Response::builder().status(status).header(CONTENT_TYPE, "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::from(body)).unwrap_or_else(|_| {
        Response::new(Body::from("{\"code\":\"internal\"}"))
    })
}

// ============================================================================
// SECTION: Header Helpers
// ============================================================================

/// Reads a header as a UTF-8 string.
fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Resolves the tenant header against the tenant registry.
fn resolve_tenant(
    state: &ServerState,
    headers: &HeaderMap,
) -> Result<(TenantId, String), CoreError> {
    let tenant = header_str(headers, HEADER_TENANT)
        .ok_or_else(|| CoreError::validation("missing_tenant", "tenant header is required"))?;
    let secret = state
        .config
        .webhook_secret(tenant)
        .ok_or_else(|| CoreError::validation("unknown_tenant", "tenant is not registered"))?;
    Ok((TenantId::new(tenant), secret.to_string()))
}

// ============================================================================
// SECTION: Router
// ============================================================================

/// Builds the router over shared server state.
#[must_use]
pub fn router(state: Arc<ServerState>) -> Router {
    let body_limit = state.config.server.max_body_bytes;
    Router::new()
        .route("/webhook", post(handle_webhook))
        .route("/runs", post(handle_create_run))
        .route("/runs/{id}", get(handle_get_run))
        .route("/runs/{id}/steps", get(handle_list_steps))
        .route("/runs/{id}/approve", post(handle_approve))
        .route("/runs/{id}/reject", post(handle_reject))
        .route("/runs/{id}/cancel", post(handle_cancel))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Serves the router on the configured bind address.
///
/// Also spawns the approval expiry sweep, which periodically fails runs
/// whose pending approval lapsed.
///
/// # Errors
///
/// Returns [`ServerError::Io`] when binding or serving fails.
pub async fn serve(state: Arc<ServerState>) -> Result<(), ServerError> {
    let bind: SocketAddr = state.config.server.bind;
    let sweep_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            run_expiry_sweep(&sweep_state);
        }
    });

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| ServerError::Io(err.to_string()))?;
    axum::serve(listener, router(state))
        .await
        .map_err(|err| ServerError::Io(err.to_string()))
}

/// Runs one approval expiry sweep over every configured tenant.
pub fn run_expiry_sweep(state: &ServerState) {
    let now = state.clock.now();
    for tenant in state.config.tenants.keys() {
        let tenant_id = TenantId::new(tenant.as_str());
        // Sweep failures are retried on the next tick.
        let _ = state.gate.sweep_expired(&tenant_id, now);
    }
}

// ============================================================================
// SECTION: Webhook Handler
// ============================================================================

/// Handles `POST /webhook`: authenticate, dedup, trigger a run.
async fn handle_webhook(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let correlation_id = state.correlation_id();
    let outcome = webhook_inner(&state, &headers, &body, &correlation_id);
    finishing_audit(&state, "POST", "/webhook", &headers, body.len(), &outcome, &correlation_id);
    outcome.unwrap_or_else(|error| error_response(&error, correlation_id))
}

/// Webhook intake pipeline.
fn webhook_inner(
    state: &ServerState,
    headers: &HeaderMap,
    body: &Bytes,
    correlation_id: &str,
) -> Result<Response, CoreError> {
    let (tenant_id, secret) = resolve_tenant(state, headers)?;

    let delivery_id = header_str(headers, HEADER_DELIVERY_ID).ok_or_else(|| {
        CoreError::validation("missing_delivery_id", "delivery id header is required")
    })?;
    let signature = header_str(headers, HEADER_SIGNATURE).ok_or_else(|| {
        CoreError::new(ErrorKind::PolicyDenied, "missing_signature", "signature is required")
    })?;
    if verify_signature(&secret, body, signature).is_err() {
        return Err(CoreError::new(
            ErrorKind::PolicyDenied,
            "signature_invalid",
            "webhook signature verification failed",
        ));
    }

    let now = state.clock.now();
    state.limiter.check(&tenant_id, "webhook", now)?;

    let event: WebhookEventBody = serde_json::from_slice(body)
        .map_err(|err| CoreError::validation("malformed_body", format!("body parse: {err}")))?;
    let request_hash = hash_canonical_json(&event)
        .map_err(|err| CoreError::internal(err.to_string()))?;

    let key = webhook_key("webhook", delivery_id);
    match state.idempotency.begin(&tenant_id, TriggerOrigin::Webhook, &key, request_hash, now) {
        Ok(BeginOutcome::New {
            ..
        }) => {
            let response = trigger_webhook_run(state, &tenant_id, &event, now);
            match response {
                Ok(body) => {
                    let cached = CachedResponse {
                        status_code: 200,
                        body: body.clone(),
                    };
                    state
                        .idempotency
                        .finalize_success(&tenant_id, &key, cached, state.clock.now())
                        .map_err(|err| CoreError::internal(err.to_string()))?;
                    Ok(json_response(StatusCode::OK, body, &[]))
                }
                Err(error) => {
                    let _ = state.idempotency.finalize_failure(
                        &tenant_id,
                        &key,
                        state.clock.now(),
                    );
                    Err(error)
                }
            }
        }
        Ok(BeginOutcome::Duplicate {
            response,
        }) => {
            record_replay(state, &tenant_id, correlation_id);
            let status = StatusCode::from_u16(response.status_code)
                .unwrap_or(StatusCode::OK);
            Ok(json_response(status, response.body, &[(HEADER_REPLAY, "true")]))
        }
        Ok(BeginOutcome::InProgress) => {
            let body = WebhookResponse {
                status: "processing".to_string(),
                run_id: None,
            };
            let payload =
                serde_json::to_string(&body).map_err(|err| CoreError::internal(err.to_string()))?;
            Ok(json_response(StatusCode::ACCEPTED, payload, &[]))
        }
        Ok(BeginOutcome::Exhausted) => Err(CoreError::new(
            ErrorKind::LockConflict,
            "delivery_replay_exhausted",
            "delivery replay attempts are exhausted",
        )
        .with_retryable(false)),
        Err(err) => Err(CoreError::internal(err.to_string())),
    }
}

/// Creates the run for a fresh webhook delivery.
fn trigger_webhook_run(
    state: &ServerState,
    tenant_id: &TenantId,
    event: &WebhookEventBody,
    now: Timestamp,
) -> Result<String, CoreError> {
    let fingerprint =
        hash_canonical_json(event).map_err(|err| CoreError::internal(err.to_string()))?;
    let request = CreateRun {
        tenant_id: tenant_id.clone(),
        workflow: event.workflow.unwrap_or(WorkflowKind::Triage),
        trigger: TriggerOrigin::Webhook,
        target: TargetDescriptor {
            repository: event.repository.clone(),
            pr_number: event.pr_number,
            issue_number: event.issue_number,
        },
        input_fingerprint: fingerprint,
    };

    let mut rng = state
        .rng
        .lock()
        .map_err(|_| CoreError::internal("server rng mutex poisoned"))?;
    let created = state.engine.create_run(request, now, &mut *rng);
    drop(rng);

    let body = match created {
        Ok(run) => WebhookResponse {
            status: "triggered".to_string(),
            run_id: Some(run.run_id.as_str().to_string()),
        },
        Err(EngineError::DuplicateFingerprint {
            existing,
        }) => WebhookResponse {
            status: "duplicate".to_string(),
            run_id: Some(existing.as_str().to_string()),
        },
        Err(err) => return Err(err.to_core_error()),
    };
    serde_json::to_string(&body).map_err(|err| CoreError::internal(err.to_string()))
}

/// Appends the idempotency replay audit event.
fn record_replay(state: &ServerState, tenant_id: &TenantId, correlation_id: &str) {
    let subject = serde_json::json!({
        "correlation_id": correlation_id,
    });
    if let Ok(payload_hash) = hash_canonical_json(&subject) {
        let _ = ledger::append(
            state.engine.store(),
            state.engine.bus(),
            tenant_id,
            None,
            "http",
            AuditEventKind::IdempotencyReplayed,
            payload_hash,
            state.clock.now(),
        );
    }
}

// ============================================================================
// SECTION: Run Handlers
// ============================================================================

/// Handles `POST /runs`: idempotent run creation.
async fn handle_create_run(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let correlation_id = state.correlation_id();
    let outcome = create_run_inner(&state, &headers, &body);
    finishing_audit(&state, "POST", "/runs", &headers, body.len(), &outcome, &correlation_id);
    outcome.unwrap_or_else(|error| error_response(&error, correlation_id))
}

/// Run creation pipeline.
fn create_run_inner(
    state: &ServerState,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response, CoreError> {
    let (tenant_id, _secret) = resolve_tenant(state, headers)?;
    let now = state.clock.now();
    state.limiter.check(&tenant_id, "runs", now)?;

    // Unsafe mutations require an idempotency key.
    let request_id = header_str(headers, HEADER_IDEMPOTENCY_KEY)
        .or_else(|| header_str(headers, HEADER_REQUEST_ID))
        .ok_or_else(|| {
            CoreError::validation("missing_idempotency_key", "idempotency key is required")
        })?;
    let client_id = header_str(headers, HEADER_CLIENT_ID).unwrap_or("default");
    let key = api_key(client_id, request_id);

    let request: CreateRunBody = serde_json::from_slice(body)
        .map_err(|err| CoreError::validation("malformed_body", format!("body parse: {err}")))?;
    let request_hash =
        hash_canonical_json(&request).map_err(|err| CoreError::internal(err.to_string()))?;

    match state.idempotency.begin(&tenant_id, TriggerOrigin::Api, &key, request_hash, now) {
        Ok(BeginOutcome::New {
            ..
        }) => {
            let fingerprint = hash_canonical_json(&request)
                .map_err(|err| CoreError::internal(err.to_string()))?;
            let create = CreateRun {
                tenant_id: tenant_id.clone(),
                workflow: request.workflow,
                trigger: TriggerOrigin::Api,
                target: TargetDescriptor {
                    repository: request.repository,
                    pr_number: request.pr_number,
                    issue_number: request.issue_number,
                },
                input_fingerprint: fingerprint,
            };
            let mut rng = state
                .rng
                .lock()
                .map_err(|_| CoreError::internal("server rng mutex poisoned"))?;
            let created = state.engine.create_run(create, now, &mut *rng);
            drop(rng);
            let run = created.map_err(|err| err.to_core_error())?;

            let response = RunCreatedResponse {
                run_id: run.run_id.as_str().to_string(),
                status: run.status,
            };
            let payload = serde_json::to_string(&response)
                .map_err(|err| CoreError::internal(err.to_string()))?;
            let cached = CachedResponse {
                status_code: 200,
                body: payload.clone(),
            };
            state
                .idempotency
                .finalize_success(&tenant_id, &key, cached, state.clock.now())
                .map_err(|err| CoreError::internal(err.to_string()))?;
            Ok(json_response(
                StatusCode::OK,
                payload,
                &[(HEADER_IDEMPOTENCY_KEY, request_id)],
            ))
        }
        Ok(BeginOutcome::Duplicate {
            response,
        }) => {
            let status = StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::OK);
            Ok(json_response(
                status,
                response.body,
                &[(HEADER_IDEMPOTENCY_KEY, request_id), (HEADER_REPLAY, "true")],
            ))
        }
        Ok(BeginOutcome::InProgress) => Ok(json_response(
            StatusCode::ACCEPTED,
            "{\"status\":\"processing\"}".to_string(),
            &[(HEADER_IDEMPOTENCY_KEY, request_id)],
        )),
        Ok(BeginOutcome::Exhausted) => Err(CoreError::new(
            ErrorKind::PolicyDenied,
            "request_exhausted",
            "request attempts are exhausted",
        )),
        Err(err) => Err(CoreError::internal(err.to_string())),
    }
}

/// Handles `GET /runs/{id}`: tenant-scoped read.
async fn handle_get_run(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let correlation_id = state.correlation_id();
    let outcome = get_run_inner(&state, &headers, &id);
    finishing_audit(&state, "GET", "/runs/{id}", &headers, 0, &outcome, &correlation_id);
    outcome.unwrap_or_else(|error| error_response(&error, correlation_id))
}

/// Run read pipeline.
fn get_run_inner(
    state: &ServerState,
    headers: &HeaderMap,
    id: &str,
) -> Result<Response, CoreError> {
    let (tenant_id, _secret) = resolve_tenant(state, headers)?;
    let now = state.clock.now();
    let run = state
        .engine
        .get_run(&RunId::new(id), now)
        .map_err(|err| err.to_core_error())?;
    if run.tenant_id != tenant_id {
        // Cross-tenant probes read as not found.
        return Err(CoreError::validation("run_not_found", format!("run not found: {id}")));
    }
    let payload =
        serde_json::to_string(&run).map_err(|err| CoreError::internal(err.to_string()))?;
    Ok(json_response(StatusCode::OK, payload, &[]))
}

/// Handles `GET /runs/{id}/steps`: tenant-scoped step listing.
async fn handle_list_steps(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let correlation_id = state.correlation_id();
    let outcome = list_steps_inner(&state, &headers, &id);
    finishing_audit(&state, "GET", "/runs/{id}/steps", &headers, 0, &outcome, &correlation_id);
    outcome.unwrap_or_else(|error| error_response(&error, correlation_id))
}

/// Step listing pipeline.
fn list_steps_inner(
    state: &ServerState,
    headers: &HeaderMap,
    id: &str,
) -> Result<Response, CoreError> {
    let (tenant_id, _secret) = resolve_tenant(state, headers)?;
    let now = state.clock.now();
    let run_id = RunId::new(id);
    let run = state.engine.get_run(&run_id, now).map_err(|err| err.to_core_error())?;
    if run.tenant_id != tenant_id {
        return Err(CoreError::validation("run_not_found", format!("run not found: {id}")));
    }
    let steps = state.engine.list_steps(&run_id, now).map_err(|err| err.to_core_error())?;
    let payload =
        serde_json::to_string(&steps).map_err(|err| CoreError::internal(err.to_string()))?;
    Ok(json_response(StatusCode::OK, payload, &[]))
}

// ============================================================================
// SECTION: Decision Handlers
// ============================================================================

/// Handles `POST /runs/{id}/approve`.
async fn handle_approve(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let correlation_id = state.correlation_id();
    let outcome = decision_inner(&state, &headers, &id, &body, ApprovalDecision::Approve);
    finishing_audit(
        &state,
        "POST",
        "/runs/{id}/approve",
        &headers,
        body.len(),
        &outcome,
        &correlation_id,
    );
    outcome.unwrap_or_else(|error| error_response(&error, correlation_id))
}

/// Handles `POST /runs/{id}/reject`.
async fn handle_reject(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let correlation_id = state.correlation_id();
    let outcome = decision_inner(&state, &headers, &id, &body, ApprovalDecision::Reject);
    finishing_audit(
        &state,
        "POST",
        "/runs/{id}/reject",
        &headers,
        body.len(),
        &outcome,
        &correlation_id,
    );
    outcome.unwrap_or_else(|error| error_response(&error, correlation_id))
}

/// Shared decision pipeline for approve and reject.
fn decision_inner(
    state: &ServerState,
    headers: &HeaderMap,
    id: &str,
    body: &Bytes,
    expected: ApprovalDecision,
) -> Result<Response, CoreError> {
    let (tenant_id, _secret) = resolve_tenant(state, headers)?;
    let decision: SignedDecision = serde_json::from_slice(body)
        .map_err(|err| CoreError::validation("malformed_body", format!("body parse: {err}")))?;
    if decision.payload.run_id.as_str() != id {
        return Err(CoreError::validation(
            "run_mismatch",
            "decision payload references a different run",
        ));
    }
    if decision.payload.decision != expected {
        return Err(CoreError::validation(
            "decision_mismatch",
            "decision does not match the endpoint",
        ));
    }

    let now = state.clock.now();
    let run = state
        .engine
        .get_run(&decision.payload.run_id, now)
        .map_err(|err| err.to_core_error())?;
    if run.tenant_id != tenant_id {
        return Err(CoreError::validation("run_not_found", format!("run not found: {id}")));
    }

    match state.gate.decide(&decision, now) {
        Ok(outcome) => {
            let response = DecisionResponse {
                status: match outcome.record.status {
                    ApprovalStatus::Approved => "approved".to_string(),
                    ApprovalStatus::Rejected => "rejected".to_string(),
                    ApprovalStatus::Pending => "pending".to_string(),
                    ApprovalStatus::Expired => "expired".to_string(),
                },
            };
            let payload = serde_json::to_string(&response)
                .map_err(|err| CoreError::internal(err.to_string()))?;
            Ok(json_response(StatusCode::OK, payload, &[]))
        }
        Err(GateError::Invalid {
            reason,
        }) => Err(CoreError::approval_invalid(reason)),
        Err(GateError::NoPendingApproval(run)) => Err(CoreError::new(
            ErrorKind::ApprovalInvalid,
            "no_pending_approval",
            format!("no pending approval for {run}"),
        )),
        Err(err) => Err(err.to_core_error()),
    }
}

/// Handles `POST /runs/{id}/cancel`.
async fn handle_cancel(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let correlation_id = state.correlation_id();
    let outcome = cancel_inner(&state, &headers, &id);
    finishing_audit(&state, "POST", "/runs/{id}/cancel", &headers, 0, &outcome, &correlation_id);
    outcome.unwrap_or_else(|error| error_response(&error, correlation_id))
}

/// Cancellation pipeline.
fn cancel_inner(
    state: &ServerState,
    headers: &HeaderMap,
    id: &str,
) -> Result<Response, CoreError> {
    let (tenant_id, _secret) = resolve_tenant(state, headers)?;
    let now = state.clock.now();
    let run_id = RunId::new(id);
    let run = state.engine.get_run(&run_id, now).map_err(|err| err.to_core_error())?;
    if run.tenant_id != tenant_id {
        return Err(CoreError::validation("run_not_found", format!("run not found: {id}")));
    }
    let cancelled = state
        .engine
        .transition_run(
            &run_id,
            RunStatus::Cancelled,
            Some("cancelled via api".to_string()),
            None,
            now,
        )
        .map_err(|err| err.to_core_error())?;
    let payload =
        serde_json::to_string(&cancelled).map_err(|err| CoreError::internal(err.to_string()))?;
    Ok(json_response(StatusCode::OK, payload, &[]))
}

// ============================================================================
// SECTION: Audit Helper
// ============================================================================

/// Emits the request audit event for a finished handler.
fn finishing_audit(
    state: &ServerState,
    method: &str,
    path: &str,
    headers: &HeaderMap,
    request_bytes: usize,
    outcome: &Result<Response, CoreError>,
    correlation_id: &str,
) {
    let (status, classification) = match outcome {
        Ok(response) => {
            let replayed = response.headers().contains_key(HEADER_REPLAY);
            (
                response.status().as_u16(),
                if replayed {
                    RequestOutcome::Replayed
                } else {
                    RequestOutcome::Ok
                },
            )
        }
        Err(error) => {
            let status = status_for(error.kind, &error.code).as_u16();
            let classification = if error.kind == ErrorKind::Internal {
                RequestOutcome::Error
            } else {
                RequestOutcome::Rejected
            };
            (status, classification)
        }
    };
    state.audit.emit(&HttpAuditEvent {
        event: "http_request",
        timestamp_ms: state.clock.now().as_unix_millis(),
        method: method.to_string(),
        path: path.to_string(),
        tenant: header_str(headers, HEADER_TENANT).map(str::to_string),
        status,
        outcome: classification,
        request_bytes,
        response_bytes: 0,
        correlation_id: Some(correlation_id.to_string()),
    });
}
