use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use super::GatewayHttpState;
use super::errors::gateway_error_response;
use crate::gateway::RequestContext;
use crate::gateway::auth::mtls::TlsPeer;
use crate::gateway::config::AuthMethod;

pub(super) fn request_context(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    body: Bytes,
    trust_client_cert: bool,
) -> RequestContext {
    let path = uri
        .path_and_query()
        .map(|value| value.as_str())
        .unwrap_or_else(|| uri.path());
    let mut ctx = RequestContext::new(method.as_str(), path).with_body(body);
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            ctx = ctx.with_header(name.as_str(), value);
        }
    }
    if let Some(peer) = peer {
        ctx = ctx.with_peer_addr(peer.ip().to_string());
    }
    // Certificate headers come from the TLS terminator; ignored unless mTLS is on.
    if trust_client_cert {
        if let Some(tls) = TlsPeer::from_headers(&ctx.headers) {
            ctx = ctx.with_tls(tls);
        }
    }
    ctx
}

pub(super) async fn handle_relay(
    State(state): State<GatewayHttpState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut ctx = request_context(
        &method,
        &uri,
        &headers,
        connect.map(|ConnectInfo(addr)| addr),
        body,
        state
            .heimdall
            .config()
            .auth
            .methods
            .contains(&AuthMethod::Mtls),
    );

    match state.heimdall.relay(&mut ctx).await {
        Ok(upstream) => {
            let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut response = Response::new(Body::from(upstream.body));
            *response.status_mut() = status;
            let content_type = upstream
                .content_type
                .as_deref()
                .unwrap_or("application/json");
            if let Ok(value) = content_type.parse() {
                response.headers_mut().insert("content-type", value);
            }
            if let Ok(value) = ctx.request_id.parse() {
                response.headers_mut().insert("x-request-id", value);
            }
            response
        }
        Err(err) => gateway_error_response(&err, &ctx.request_id),
    }
}

pub(super) async fn health() -> impl IntoResponse {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

pub(super) async fn metrics(State(state): State<GatewayHttpState>) -> impl IntoResponse {
    axum::Json(state.heimdall.observability())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_cert_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-client-cert-cn", "svc-a".parse().expect("header"));
        headers.insert("x-tls-version", "TLSv1.3".parse().expect("header"));
        headers
    }

    #[test]
    fn forwarded_client_cert_becomes_tls_peer() {
        let uri: Uri = "/v1/chat/completions".parse().expect("uri");
        let ctx = request_context(
            &Method::POST,
            &uri,
            &with_cert_headers(),
            None,
            Bytes::new(),
            true,
        );
        let tls = ctx.tls.expect("tls peer");
        assert_eq!(tls.common_name.as_deref(), Some("svc-a"));
        assert_eq!(tls.version.as_deref(), Some("TLSv1.3"));
    }

    #[test]
    fn client_cert_headers_ignored_without_mtls() {
        let uri: Uri = "/v1/chat/completions".parse().expect("uri");
        let ctx = request_context(
            &Method::POST,
            &uri,
            &with_cert_headers(),
            None,
            Bytes::new(),
            false,
        );
        assert!(ctx.tls.is_none());
    }
}
