use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;

use crate::gateway::{GatewayError, StoreError};

#[derive(Debug, Serialize)]
pub(super) struct AdminEnvelope<T: Serialize> {
    success: bool,
    data: T,
}

pub(super) fn admin_ok<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(AdminEnvelope { success: true, data })).into_response()
}

pub(super) fn admin_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "success": false, "message": message.into() })),
    )
        .into_response()
}

pub(super) fn admin_store_error(err: &StoreError) -> Response {
    let status = match err {
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::VoucherRejected { .. } | StoreError::InvalidSubject(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "admin request failed");
    }
    admin_error(status, err.to_string())
}

/// Maps an admission or relay failure to its client-facing body. The request id is
/// echoed in every shape that carries one.
pub(super) fn gateway_error_response(err: &GatewayError, request_id: &str) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let message = err.to_string();
    let body = match err {
        GatewayError::Unauthenticated { .. } => json!({
            "error": "authentication_failed",
            "message": message,
            "request_id": request_id,
        }),
        GatewayError::Replay { .. }
        | GatewayError::SchemaInvalid { .. }
        | GatewayError::InvalidRequest { .. } => json!({
            "error": "validation_failed",
            "message": message,
            "request_id": request_id,
        }),
        GatewayError::IpBlocked { reason } => json!({
            "error": {
                "type": "ip_blocked",
                "code": "ip_protection_violation",
                "message": reason,
            }
        }),
        GatewayError::UserBlocked { code, reason } => json!({
            "error": {
                "type": "forbidden",
                "code": code,
                "message": reason,
            }
        }),
        GatewayError::RateLimited { status } => json!({
            "error": "rate_limit_exceeded",
            "message": message,
            "rate_limit_status": status,
        }),
        GatewayError::PlanExhausted { .. }
        | GatewayError::BalanceInsufficient { .. }
        | GatewayError::ModelRestricted { .. } => json!({
            "success": false,
            "message": message,
        }),
        GatewayError::Store { .. } => json!({
            "error": {
                "type": "server_error",
                "message": "internal error",
            },
            "request_id": request_id,
        }),
        GatewayError::Upstream { .. } => json!({
            "error": {
                "type": "upstream_error",
                "message": message,
            },
            "request_id": request_id,
        }),
    };
    let mut response = (status, Json(body)).into_response();
    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}
