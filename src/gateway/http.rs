//! axum surface: relay routes, `/health`, `/metrics` and the `/admin` API.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{any, get};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::Heimdall;

mod admin;
mod errors;
mod relay;

#[derive(Clone)]
pub struct GatewayHttpState {
    heimdall: Arc<Heimdall>,
    admin_token: Option<String>,
    max_body_bytes: usize,
}

impl GatewayHttpState {
    pub fn new(heimdall: Arc<Heimdall>) -> Self {
        let admin_token = heimdall
            .config()
            .admin_token
            .clone()
            .filter(|token| !token.trim().is_empty());
        Self {
            heimdall,
            admin_token,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes.max(1);
        self
    }

    pub fn heimdall(&self) -> &Arc<Heimdall> {
        &self.heimdall
    }
}

pub fn router(state: GatewayHttpState) -> Router {
    let body_limit = state.max_body_bytes;
    Router::new()
        .route("/health", get(relay::health))
        .route("/metrics", get(relay::metrics))
        .nest("/admin", admin::routes())
        .route("/v1/*rest", any(relay::handle_relay))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Serves until `shutdown` is cancelled; in-flight requests finish first.
pub async fn serve(
    state: GatewayHttpState,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "heimdall gateway listening");
    }
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
}
