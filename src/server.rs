//! HTTP surface: OpenAI-compatible chat completions plus the internal
//! inspection endpoints.
//!
//! The transport layer owns nothing the core depends on: it resolves the
//! identity triple from extension headers, renders routing metadata as
//! headers and the `x_routing_decision` field, and maps [`GatewayError`]
//! to stable machine-readable error bodies. Authentication middleware sits
//! in front of this router and is out of scope here.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::audit::AuditFilter;
use crate::config::Settings;
use crate::engine::{RoutedResponse, RoutingEngine, RoutingOutcome, SimulateSpec};
use crate::metrics;
use crate::policy::PolicyOutcome;
use crate::protocol::{chunk_for_event, ChatCompletionRequest, RequestIdentity};
use crate::{GatewayError, RequestId};

/// Shared handler state.
pub struct AppState {
    pub engine: Arc<RoutingEngine>,
    /// Global concurrency ceiling across all inbound requests.
    pub limiter: Arc<Semaphore>,
}

/// Build the full router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/internal/routing/policies", get(list_policies))
        .route("/internal/routing/policies/reload", post(reload_policies))
        .route("/internal/routing/simulate", post(simulate))
        .route("/internal/routing/budget/status", post(budget_status))
        .route("/internal/audit/logs", get(audit_logs))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn start_server(settings: &Settings, engine: Arc<RoutingEngine>) -> Result<(), GatewayError> {
    let state = Arc::new(AppState {
        engine,
        limiter: Arc::new(Semaphore::new(settings.max_concurrent_requests)),
    });
    let app = build_router(state);
    let addr = format!("{}:{}", settings.host, settings.port);
    info!(addr = %addr, "gateway listening");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| GatewayError::Config(format!("cannot bind {addr}: {e}")))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| GatewayError::Internal(format!("server error: {e}")))
}

// ── Error rendering ────────────────────────────────────────────────────────

struct ApiError {
    error: GatewayError,
    request_id: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.error {
            GatewayError::GovernanceBlocked { .. } => StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS,
            GatewayError::AllProvidersFailed { .. } | GatewayError::Provider { .. } => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::ClientCancelled => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let mut body = serde_json::json!({
            "error": {
                "code": self.error.code(),
                "message": self.error.to_string(),
                "request_id": self.request_id,
            }
        });
        if matches!(self.error, GatewayError::GovernanceBlocked { .. }) {
            body["error"]["governance_blocked"] = serde_json::Value::Bool(true);
        }
        (status, Json(body)).into_response()
    }
}

// ── Chat completions ───────────────────────────────────────────────────────

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
}

fn identity_from_headers(headers: &HeaderMap) -> RequestIdentity {
    RequestIdentity {
        tenant_id: header_str(headers, "x-tenant-id"),
        user_id: header_str(headers, "x-user-id"),
        department: header_str(headers, "x-department"),
    }
}

fn routing_headers(outcome: &RoutingOutcome) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let mut set = |name: &'static str, value: &str| {
        if let Ok(v) = HeaderValue::from_str(value) {
            headers.insert(name, v);
        }
    };
    set("x-request-id", &outcome.request_id);
    set("x-routing-model", &outcome.model_used);
    set("x-routing-provider", &outcome.provider_used);
    set("x-task-type", outcome.classification.task_type.as_str());
    set("x-complexity", outcome.classification.complexity.as_str());
    set("x-risk-level", outcome.risk.level.as_str());
    set(
        "x-audit-required",
        if outcome.risk.audit_required { "true" } else { "false" },
    );
    headers
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut body): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    let request_id = RequestId::generate();
    body.identity = identity_from_headers(&headers);
    body.idempotency_key = header_str(&headers, "idempotency-key");

    // Honoring the key by replaying a stored response belongs to the
    // persistent store; here it is carried into the decision record only.
    let _permit = state
        .limiter
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ApiError {
            error: GatewayError::Internal("request limiter closed".into()),
            request_id: request_id.to_string(),
        })?;

    let stream_requested = body.stream;
    let engine = Arc::clone(&state.engine);

    // Run the pipeline on a detached task: if the client hangs up mid-call,
    // the decision record still completes.
    let id_for_engine = request_id.clone();
    let routed = tokio::spawn(async move { engine.route(body, id_for_engine).await })
        .await
        .map_err(|e| ApiError {
            error: GatewayError::Internal(format!("routing task failed: {e}")),
            request_id: request_id.to_string(),
        })?
        .map_err(|error| ApiError {
            error,
            request_id: request_id.to_string(),
        })?;

    let (response, outcome) = routed;
    let headers = routing_headers(&outcome);

    match response {
        RoutedResponse::Buffered(mut completion) => {
            completion.x_routing_decision = Some(outcome.decision_json());
            Ok((headers, Json(completion)).into_response())
        }
        RoutedResponse::Stream(mut provider_stream) => {
            debug_assert!(stream_requested);
            let decision_json = outcome.decision_json();
            let chunk_id = outcome.request_id.clone();
            let model = outcome.model_used.clone();
            let request_id = outcome.request_id.clone();
            let created = chrono::Utc::now().timestamp();

            let (mut tx, rx) = futures::channel::mpsc::channel::<Result<Event, Infallible>>(0);
            tokio::spawn(async move {
                // Named initial event first: the client sees a stable
                // request id before any provider bytes, fallback or not.
                let decision_event = Event::default()
                    .event("routing_decision")
                    .data(decision_json.to_string());
                if tx.send(Ok(decision_event)).await.is_err() {
                    return;
                }

                let mut errored = false;
                while let Some(item) = provider_stream.next().await {
                    match item {
                        Ok(event) => {
                            let chunk = chunk_for_event(&event, &chunk_id, &model, created);
                            if tx.send(Ok(Event::default().data(chunk.to_string()))).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            // Streaming failure is terminal by design.
                            errored = true;
                            let payload = serde_json::json!({
                                "error": {
                                    "code": e.code(),
                                    "message": e.to_string(),
                                    "request_id": request_id,
                                }
                            });
                            let _ = tx
                                .send(Ok(Event::default().event("error").data(payload.to_string())))
                                .await;
                            break;
                        }
                    }
                }
                if !errored {
                    let _ = tx.send(Ok(Event::default().data("[DONE]"))).await;
                }
            });

            let sse = Sse::new(rx).keep_alive(KeepAlive::default());
            Ok((headers, sse).into_response())
        }
    }
}

// ── Models & health ────────────────────────────────────────────────────────

async fn list_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let catalog = state.engine.catalog();
    let concrete: Vec<_> = catalog
        .concrete_models()
        .iter()
        .map(|m| {
            serde_json::json!({
                "id": m.model_id,
                "object": "model",
                "provider": m.provider,
                "tier": m.tier.as_str(),
                "capabilities": m.capabilities,
                "context_window": m.context_window,
            })
        })
        .collect();
    let mut virtual_models: Vec<_> = catalog
        .virtual_models()
        .iter()
        .map(|(id, vm)| {
            serde_json::json!({
                "id": id,
                "object": "model",
                "virtual": true,
                "resolves_to": vm.models,
                "description": vm.description,
            })
        })
        .collect();
    virtual_models.sort_by_key(|v| v["id"].as_str().unwrap_or_default().to_string());

    Json(serde_json::json!({
        "object": "list",
        "data": concrete,
        "virtual_models": virtual_models,
    }))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let providers = state.engine.registry().health_snapshot();
    let degraded = providers
        .values()
        .any(|h| *h != crate::providers::ProviderHealth::Healthy);
    Json(serde_json::json!({
        "status": if degraded { "degraded" } else { "healthy" },
        "version": env!("CARGO_PKG_VERSION"),
        "providers": providers,
    }))
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

// ── Internal: policies, simulation, budget, audit ──────────────────────────

async fn list_policies(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let snapshot = state.engine.policy_store().snapshot();
    let policies: Vec<_> = snapshot
        .all()
        .iter()
        .map(|p| {
            serde_json::json!({
                "tenant_id": p.tenant_id,
                "department": p.department,
                "version": p.version,
                "description": p.description,
                "rule_count": p.rules.len(),
                "rules": p.rules,
                "budget": p.budget,
            })
        })
        .collect();
    Json(serde_json::json!({ "policies": policies }))
}

async fn reload_policies(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    match state.engine.policy_store().reload() {
        Ok(count) => Ok(Json(serde_json::json!({
            "status": "ok",
            "policies_loaded": count,
            "departments": state.engine.policy_store().snapshot().departments(),
        }))),
        Err(error) => Err(ApiError {
            error,
            request_id: RequestId::generate().to_string(),
        }),
    }
}

async fn simulate(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<SimulateSpec>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state.engine.simulate(&spec).map_err(|error| ApiError {
        error,
        request_id: RequestId::generate().to_string(),
    })?;
    let body = match outcome {
        PolicyOutcome::Selected(route) => serde_json::json!({
            "outcome": "selected",
            "decision": route,
        }),
        PolicyOutcome::Blocked(blocked) => serde_json::json!({
            "outcome": "governance_blocked",
            "detail": blocked,
        }),
        PolicyOutcome::NoRuleMatched {
            policy_version,
            trace,
            constraints_applied,
        } => serde_json::json!({
            "outcome": "no_rule_matched",
            "policy_version": policy_version,
            "policy_trace": trace,
            "constraints_applied": constraints_applied,
        }),
    };
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
struct BudgetStatusRequest {
    tenant_id: String,
    user_id: String,
}

async fn budget_status(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BudgetStatusRequest>,
) -> Json<serde_json::Value> {
    let counters = state
        .engine
        .budget_store()
        .spend(&req.tenant_id, &req.user_id)
        .await;
    Json(serde_json::json!({
        "tenant_id": req.tenant_id,
        "user_id": req.user_id,
        "counters": counters,
    }))
}

async fn audit_logs(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<AuditFilter>,
) -> Json<serde_json::Value> {
    let records = state.engine.recorder().read(&filter).await;
    Json(serde_json::json!({
        "count": records.len(),
        "records": records,
    }))
}
