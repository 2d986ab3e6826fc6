//! HTTP control plane
//!
//! Two surfaces on one router:
//!
//! - [`sabnzbd`] — the SABnzbd-compatible `/api` endpoint that download
//!   automation tools (Sonarr, Radarr, ...) speak natively
//! - [`admin`] — server management, VPN control, and queue-item removal,
//!   documented via OpenAPI at `/api/openapi.json`
//!
//! The control plane is unauthenticated and CORS-permissive; it is meant
//! to sit on a trusted LAN or behind a reverse proxy.

pub mod admin;
pub mod sabnzbd;

use crate::config::SharedConfig;
use crate::engine::Engine;
use crate::nntp::PoolManager;
use crate::queue::QueueStore;
use crate::vpn::VpnManager;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use utoipa::OpenApi;

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    /// Job queue and history
    pub store: Arc<QueueStore>,
    /// Download engine (wake + cancel)
    pub engine: Engine,
    /// NNTP pools (server reconciliation, interface introspection)
    pub pool_manager: Arc<PoolManager>,
    /// VPN coordinator
    pub vpn: VpnManager,
    /// Mutable configuration with save-back
    pub config: SharedConfig,
}

/// OpenAPI document for the admin surface
#[derive(OpenApi)]
#[openapi(
    info(
        title = "nzb-connect admin API",
        description = "Server, VPN, and queue management endpoints. The \
                       SABnzbd-compatible surface at /api is not described \
                       here; it follows the SABnzbd wire format.",
        version = "0.1.0",
    ),
    paths(
        admin::list_servers,
        admin::add_server,
        admin::update_server,
        admin::delete_server,
        admin::test_server,
        admin::delete_queue_item,
        admin::get_vpn,
        admin::update_vpn,
        admin::vpn_connect,
        admin::vpn_disconnect,
        admin::vpn_status,
    ),
    components(schemas(
        crate::config::ServerConfig,
        crate::config::VpnConfig,
        crate::config::WireGuardConfig,
        crate::config::OpenVpnConfig,
        crate::vpn::ConnectorState,
        crate::vpn::ConnectorStatus,
    ))
)]
pub struct ApiDoc;

/// Build the full router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api", get(sabnzbd::handle_get).post(sabnzbd::handle_post))
        .route(
            "/api/servers",
            get(admin::list_servers).post(admin::add_server),
        )
        .route("/api/servers/test", post(admin::test_server))
        .route(
            "/api/servers/:id",
            axum::routing::put(admin::update_server).delete(admin::delete_server),
        )
        .route("/api/queue/:id", delete(admin::delete_queue_item))
        .route(
            "/api/vpn",
            get(admin::get_vpn).put(admin::update_vpn),
        )
        .route("/api/vpn/connect", post(admin::vpn_connect))
        .route("/api/vpn/disconnect", post(admin::vpn_disconnect))
        .route("/api/vpn/status", get(admin::vpn_status))
        .route("/api/openapi.json", get(openapi_spec))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Bind and serve the control plane until the process exits
pub async fn serve(state: AppState, port: u16) -> crate::error::Result<()> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| crate::error::Error::ApiServer(format!("bind {addr}: {e}")))?;
    info!(%addr, "control plane listening");
    axum::serve(listener, router)
        .await
        .map_err(|e| crate::error::Error::ApiServer(e.to_string()))
}
