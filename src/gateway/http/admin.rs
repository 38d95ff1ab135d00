use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{delete, get, post};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::GatewayHttpState;
use super::errors::{admin_error, admin_ok, admin_store_error};
use crate::gateway::scheduler::Job;
use crate::gateway::store_types::AnomalyStatus;

const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1000;

pub(super) fn routes() -> Router<GatewayHttpState> {
    Router::new()
        .route("/telemetry/stats", get(telemetry_stats))
        .route("/anomalies", get(list_anomalies))
        .route("/anomalies/:id/approve", post(approve_anomaly))
        .route("/anomalies/:id/ignore", post(ignore_anomaly))
        .route("/ip-bans", get(list_ip_bans).post(create_ip_ban))
        .route("/ip-bans/:ip", delete(delete_ip_ban))
        .route("/flags", get(list_flags))
        .route("/vouchers/redeem", post(redeem_voucher))
        .route("/jobs/:name", post(run_job))
}

fn ensure_admin(state: &GatewayHttpState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(admin_error(
            StatusCode::NOT_FOUND,
            "admin auth not configured",
        ));
    };
    let provided = extract_bearer(headers).or_else(|| extract_header(headers, "x-admin-token"));
    if provided.as_deref() == Some(expected) {
        Ok(())
    } else {
        Err(admin_error(StatusCode::UNAUTHORIZED, "invalid admin token"))
    }
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = extract_header(headers, "authorization")?;
    let token = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn list_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

async fn telemetry_stats(State(state): State<GatewayHttpState>, headers: HeaderMap) -> Response {
    if let Err(response) = ensure_admin(&state, &headers) {
        return response;
    }
    admin_ok(state.heimdall.telemetry().stats())
}

#[derive(Debug, Default, Deserialize)]
struct AnomalyQuery {
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_anomalies(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Query(query): Query<AnomalyQuery>,
) -> Response {
    if let Err(response) = ensure_admin(&state, &headers) {
        return response;
    }
    let status = match query.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        None => None,
        Some(raw) => match AnomalyStatus::parse(raw) {
            Some(status) => Some(status),
            None => {
                return admin_error(
                    StatusCode::BAD_REQUEST,
                    format!("unknown anomaly status: {raw}"),
                );
            }
        },
    };
    match state
        .heimdall
        .anomaly()
        .list(status, list_limit(query.limit))
        .await
    {
        Ok(anomalies) => admin_ok(anomalies),
        Err(err) => admin_store_error(&err),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ReviewRequest {
    #[serde(default)]
    reviewer_id: i64,
    #[serde(default)]
    rationale: Option<String>,
}

async fn approve_anomaly(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(review): Json<ReviewRequest>,
) -> Response {
    if let Err(response) = ensure_admin(&state, &headers) {
        return response;
    }
    match state
        .heimdall
        .anomaly()
        .approve(id, review.reviewer_id, review.rationale.as_deref())
        .await
    {
        Ok(anomaly) => admin_ok(anomaly),
        Err(err) => admin_store_error(&err),
    }
}

async fn ignore_anomaly(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(review): Json<ReviewRequest>,
) -> Response {
    if let Err(response) = ensure_admin(&state, &headers) {
        return response;
    }
    match state
        .heimdall
        .anomaly()
        .ignore(id, review.reviewer_id, review.rationale.as_deref())
        .await
    {
        Ok(anomaly) => admin_ok(anomaly),
        Err(err) => admin_store_error(&err),
    }
}

async fn list_ip_bans(State(state): State<GatewayHttpState>, headers: HeaderMap) -> Response {
    if let Err(response) = ensure_admin(&state, &headers) {
        return response;
    }
    match state.heimdall.ip_protection().bans().await {
        Ok(bans) => admin_ok(bans),
        Err(err) => admin_store_error(&err),
    }
}

#[derive(Debug, Deserialize)]
struct BanRequest {
    ip: String,
    #[serde(default)]
    reason: Option<String>,
    /// Absent for a permanent ban.
    #[serde(default)]
    duration_secs: Option<u64>,
}

async fn create_ip_ban(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Json(request): Json<BanRequest>,
) -> Response {
    if let Err(response) = ensure_admin(&state, &headers) {
        return response;
    }
    let ip = request.ip.trim();
    if ip.is_empty() {
        return admin_error(StatusCode::BAD_REQUEST, "ip is required");
    }
    let reason = request.reason.as_deref().unwrap_or("manual ban");
    let duration = request.duration_secs.map(Duration::from_secs);
    match state.heimdall.ip_protection().ban(ip, reason, duration).await {
        Ok(id) => admin_ok(serde_json::json!({ "id": id, "ip": ip })),
        Err(err) => admin_store_error(&err),
    }
}

async fn delete_ip_ban(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path(ip): Path<String>,
) -> Response {
    if let Err(response) = ensure_admin(&state, &headers) {
        return response;
    }
    match state.heimdall.ip_protection().unban(&ip).await {
        Ok(true) => admin_ok(serde_json::json!({ "ip": ip, "lifted": true })),
        Ok(false) => admin_error(StatusCode::NOT_FOUND, format!("no active ban for {ip}")),
        Err(err) => admin_store_error(&err),
    }
}

#[derive(Debug, Default, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn list_flags(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Query(query): Query<LimitQuery>,
) -> Response {
    if let Err(response) = ensure_admin(&state, &headers) {
        return response;
    }
    match state
        .heimdall
        .store()
        .list_flags(list_limit(query.limit))
        .await
    {
        Ok(flags) => admin_ok(flags),
        Err(err) => admin_store_error(&err),
    }
}

#[derive(Debug, Deserialize)]
struct RedeemRequest {
    code: String,
    user_id: i64,
}

async fn redeem_voucher(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Json(request): Json<RedeemRequest>,
) -> Response {
    if let Err(response) = ensure_admin(&state, &headers) {
        return response;
    }
    match state
        .heimdall
        .vouchers()
        .redeem_voucher(&request.code, request.user_id)
        .await
    {
        Ok(outcome) => admin_ok(outcome),
        Err(err) => admin_store_error(&err),
    }
}

async fn run_job(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Response {
    if let Err(response) = ensure_admin(&state, &headers) {
        return response;
    }
    let Some(job) = Job::parse(&name) else {
        return admin_error(StatusCode::NOT_FOUND, format!("unknown job: {name}"));
    };
    tracing::info!(job = %job, "job triggered from admin api");
    match state
        .heimdall
        .scheduler()
        .run_job(job, &CancellationToken::new())
        .await
    {
        Ok(report) => admin_ok(report),
        Err(err) => admin_store_error(&err),
    }
}
