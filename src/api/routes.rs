use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, ConnectInfo, Path, Query, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use ipnet::IpNet;
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::decision_log::DecisionLogger;
use crate::domain::{Decision, DecisionStage, RequestDescriptor, RuleSource};
use crate::engine::RuleMatcher;
use crate::kpi::{KpiAggregator, KpiSnapshot, KpiWindow};
use crate::mitigation::{MitigationOutcome, MitigationPublisher, MitigationRequest};
use crate::observability::metrics;
use crate::policy::{
    parse_policy, ApprovalToken, PolicyDraft, PolicyStore, PolicySummary, PromotionGate,
    RetryPolicy, StagedSummary,
};

use super::request::{describe_request, KpiQuery, APPROVAL_TOKEN_HEADER};
use super::response::{
    ApiError, ErrorResponse, HealthResponse, ReadyResponse, RemovedResponse, StageResponse,
};

/// Shared application state.
pub struct AppState {
    /// Owner of every policy version
    pub store: Arc<PolicyStore>,

    pub matcher: RuleMatcher,

    /// Async decision log
    pub logger: DecisionLogger,

    pub publisher: MitigationPublisher,

    /// Staged policies awaiting approval
    pub gate: PromotionGate,

    pub aggregator: KpiAggregator,

    /// Retry policy for rollbacks and promotions
    pub retry: RetryPolicy,

    /// Peers allowed to name the client through X-Forwarded-For
    pub trusted_proxies: Vec<IpNet>,

    /// Prometheus exporter, absent when no recorder is installed
    pub metrics: Option<PrometheusHandle>,

    /// Application start time
    pub start_time: Instant,

    /// Application version
    pub version: String,
}

/// Create the application router.
///
/// Paths not claimed by the API are evaluated as front-door traffic.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/evaluate", post(handle_evaluate))
        .route("/v1/mitigations", post(handle_push_block))
        .route("/v1/mitigations/:rule_id", delete(handle_remove_mitigation))
        .route("/v1/kpi", get(handle_kpi))
        .route("/v1/policy", get(handle_policy))
        .route("/v1/policy/rollback/:version", post(handle_rollback))
        .route("/v1/policy/staged", get(handle_staged))
        .route("/v1/policy/stage", post(handle_stage))
        .route("/v1/policy/promote/:staged_id", post(handle_promote))
        .route("/health", get(handle_health))
        .route("/ready", get(handle_ready))
        .route("/metrics", get(handle_metrics))
        .fallback(handle_front_door)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Evaluate, then hand the decision to the logger.
async fn decide(state: &AppState, req: &RequestDescriptor) -> Decision {
    let mut decision = state.matcher.evaluate(req);

    if state.logger.record(&decision).await && decision.advance(DecisionStage::Logged) {
        metrics::record_stage(DecisionStage::Logged, 1);
    }

    if decision.is_blocked() {
        info!(
            decision_id = %decision.id,
            source = %req.source_address,
            path = %req.path,
            rule_id = decision.matched_rule_id.as_deref().unwrap_or_default(),
            policy_version = decision.policy_version,
            "Request blocked"
        );
    } else {
        debug!(decision_id = %decision.id, path = %req.path, "Request allowed");
    }

    decision
}

/// Evaluate a JSON request descriptor.
async fn handle_evaluate(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RequestDescriptor>, JsonRejection>,
) -> Result<Json<Decision>, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    Ok(Json(decide(&state, &req).await))
}

/// Front-door mode: evaluate the request itself.
async fn handle_front_door(
    State(state): State<Arc<AppState>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let peer = connect.map(|ConnectInfo(addr)| addr);
    let req = describe_request(&method, &uri, &headers, peer, &state.trusted_proxies, &body);
    let decision = decide(&state, &req).await;

    let status = if decision.is_blocked() {
        StatusCode::FORBIDDEN
    } else {
        StatusCode::OK
    };
    (status, Json(decision)).into_response()
}

/// Push an emergency block rule.
async fn handle_push_block(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<MitigationRequest>, JsonRejection>,
) -> Result<Json<MitigationOutcome>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let outcome = state.publisher.push_block(&request).await?;
    Ok(Json(outcome))
}

async fn handle_remove_mitigation(
    State(state): State<Arc<AppState>>,
    Path(rule_id): Path<String>,
) -> Result<Json<RemovedResponse>, ApiError> {
    let snapshot = state.publisher.remove(&rule_id).await?;
    Ok(Json(RemovedResponse {
        rule_id,
        applied_version: snapshot.version,
    }))
}

/// KPI snapshot over `[start, end)`.
async fn handle_kpi(
    State(state): State<Arc<AppState>>,
    Query(query): Query<KpiQuery>,
) -> Result<Json<KpiSnapshot>, ApiError> {
    let window = KpiWindow::from_millis(query.start, query.end, Utc::now())?;
    let aggregator = state.aggregator.clone();

    let snapshot = tokio::task::spawn_blocking(move || aggregator.aggregate(&window))
        .await
        .map_err(|e| ApiError::internal(format!("aggregation task failed: {}", e)))??;

    Ok(Json(snapshot))
}

async fn handle_policy(State(state): State<Arc<AppState>>) -> Json<PolicySummary> {
    Json(state.store.current().summary())
}

async fn handle_rollback(
    State(state): State<Arc<AppState>>,
    Path(version): Path<u64>,
) -> Result<Json<PolicySummary>, ApiError> {
    let snapshot = state.store.rollback(version)?;
    info!(from = version, to = snapshot.version, "Policy rolled back");
    Ok(Json(snapshot.summary()))
}

async fn handle_staged(State(state): State<Arc<AppState>>) -> Json<Vec<StagedSummary>> {
    Json(state.gate.staged())
}

/// Stage a policy document (YAML or JSON body).
async fn handle_stage(
    State(state): State<Arc<AppState>>,
    body: String,
) -> Result<(StatusCode, Json<StageResponse>), ApiError> {
    let doc = parse_policy(&body)?;
    let draft = PolicyDraft::from_doc(doc).map_err(|e| ApiError::bad_request(e.to_string()))?;
    let staged_id = state.gate.stage(draft)?;

    Ok((StatusCode::CREATED, Json(StageResponse { staged_id })))
}

async fn handle_promote(
    State(state): State<Arc<AppState>>,
    Path(staged_id): Path<u64>,
    headers: HeaderMap,
) -> Result<Json<PolicySummary>, ApiError> {
    let token = headers
        .get(APPROVAL_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(ApprovalToken::new)
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::UNAUTHORIZED,
                format!("missing {} header", APPROVAL_TOKEN_HEADER),
                "UNAUTHORIZED",
            )
        })?;

    let snapshot = state
        .gate
        .promote(&state.store, staged_id, &token, &state.retry)
        .await?;

    Ok(Json(snapshot.summary()))
}

/// Health check endpoint.
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: state.version.clone(),
        policy_version: state.store.current().version,
        uptime_secs: state.start_time.elapsed().as_secs(),
        decision_log: state.logger.stats(),
    })
}

/// Readiness check endpoint.
async fn handle_ready(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.store.current();

    // Version 0 is the empty placeholder before the first publish.
    if snapshot.version == 0 {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse::new("No policy published", "NOT_READY")),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        Json(ReadyResponse {
            ready: true,
            policy_version: snapshot.version,
            rules: snapshot.rules.len(),
            mitigation_rules: snapshot.count_source(RuleSource::Mitigation),
        }),
    )
        .into_response()
}

/// Metrics endpoint (Prometheus format).
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(
                axum::http::header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("Metrics exporter not installed", "NOT_FOUND")),
        )
            .into_response(),
    }
}
