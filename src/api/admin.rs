//! Admin endpoints: server management, VPN control, queue-item removal
//!
//! These are not part of the SABnzbd emulation; they serve the bundled web
//! UI and scripted management. VPN secrets are never echoed back — reads
//! replace them with `has_*` booleans, and writes treat blank secret
//! fields as "keep the stored value".

use super::AppState;
use crate::config::{ServerConfig, VpnConfig};
use crate::error::NntpError;
use crate::vpn::ConnectorStatus;
use crate::nntp::NntpConnection;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};

/// Bound on admin-initiated server connectivity tests
const SERVER_TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// List configured servers
#[utoipa::path(
    get,
    path = "/api/servers",
    responses((status = 200, description = "All configured servers"))
)]
pub async fn list_servers(State(state): State<AppState>) -> Json<Value> {
    let servers = state.config.servers().await;
    Json(json!({ "servers": servers }))
}

/// Add a server and reconcile the connection pools
#[utoipa::path(
    post,
    path = "/api/servers",
    request_body = ServerConfig,
    responses((status = 200, description = "Server added"))
)]
pub async fn add_server(
    State(state): State<AppState>,
    payload: Result<Json<ServerConfig>, JsonRejection>,
) -> Json<Value> {
    let Json(server) = match payload {
        Ok(json) => json,
        Err(_) => return error_response("invalid JSON"),
    };
    if server.host.is_empty() {
        return error_response("host is required");
    }

    let added = state.config.add_server(server).await;
    save_and_reconcile(&state).await;

    Json(json!({ "status": true, "server": added }))
}

/// Update a server (matched by id or name), preserving a blank password
#[utoipa::path(
    put,
    path = "/api/servers/{id}",
    params(("id" = String, Path, description = "Server id or name")),
    request_body = ServerConfig,
    responses((status = 200, description = "Server updated"))
)]
pub async fn update_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ServerConfig>, JsonRejection>,
) -> Json<Value> {
    let Json(mut server) = match payload {
        Ok(json) => json,
        Err(_) => return error_response("invalid JSON"),
    };

    // A blank password means the client did not change it
    if server.password.as_deref().unwrap_or("").is_empty() {
        if let Some(existing) = state.config.find_server(&id).await {
            server.password = existing.password;
        }
    }

    if !state.config.update_server(&id, server).await {
        return error_response("server not found");
    }
    save_and_reconcile(&state).await;

    Json(json!({ "status": true }))
}

/// Remove a server and close its pool
#[utoipa::path(
    delete,
    path = "/api/servers/{id}",
    params(("id" = String, Path, description = "Server id or name")),
    responses((status = 200, description = "Server removed"))
)]
pub async fn delete_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<Value> {
    if !state.config.delete_server(&id).await {
        return error_response("server not found");
    }
    save_and_reconcile(&state).await;
    Json(json!({ "status": true }))
}

/// Dial and authenticate against a server config without saving it.
/// The connection goes through the current VPN interface, exactly as
/// download connections would.
#[utoipa::path(
    post,
    path = "/api/servers/test",
    request_body = ServerConfig,
    responses((status = 200, description = "Test outcome"))
)]
pub async fn test_server(
    State(state): State<AppState>,
    payload: Result<Json<ServerConfig>, JsonRejection>,
) -> Json<Value> {
    let Json(mut server) = match payload {
        Ok(json) => json,
        Err(_) => return error_response("invalid JSON"),
    };
    if server.port == 0 {
        server.port = if server.tls { 563 } else { 119 };
    }

    let interface = state.pool_manager.interface().await;
    let result = tokio::time::timeout(
        SERVER_TEST_TIMEOUT,
        NntpConnection::connect(&server, &interface),
    )
    .await
    .map_err(|_| NntpError::Timeout("connect"))
    .and_then(|inner| inner);

    match result {
        Ok(conn) => {
            conn.close().await;
            Json(json!({ "status": true, "message": "Connection successful" }))
        }
        Err(e) => error_response(e.to_string()),
    }
}

/// Cancel a queued or running download
#[utoipa::path(
    delete,
    path = "/api/queue/{id}",
    params(("id" = String, Path, description = "Download id")),
    responses((status = 200, description = "Download cancelled"))
)]
pub async fn delete_queue_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<Value> {
    state
        .engine
        .cancel_download(&crate::types::DownloadId::from(id.as_str()))
        .await;
    Json(json!({ "status": true }))
}

/// Current VPN configuration with secrets replaced by `has_*` booleans
#[utoipa::path(
    get,
    path = "/api/vpn",
    responses((status = 200, description = "VPN configuration, secrets redacted"))
)]
pub async fn get_vpn(State(state): State<AppState>) -> Json<Value> {
    let vpn = state.config.vpn().await;

    let mut response = json!({
        "enabled": vpn.enabled,
        "protocol": vpn.protocol,
        "interface": vpn.interface,
    });

    if let Some(wg) = &vpn.wireguard {
        response["wireguard"] = json!({
            "has_private_key": !wg.private_key.is_empty(),
            "address": wg.address,
            "dns": wg.dns,
            "listen_port": wg.listen_port,
            "has_peer_public_key": !wg.peer_public_key.is_empty(),
            "peer_endpoint": wg.peer_endpoint,
            "has_preshared_key": !wg.preshared_key.is_empty(),
            "allowed_ips": wg.allowed_ips,
            "persistent_keepalive": wg.persistent_keepalive,
        });
    }
    if let Some(ov) = &vpn.openvpn {
        response["openvpn"] = json!({
            "remote_host": ov.remote_host,
            "remote_port": ov.remote_port,
            "protocol": ov.protocol,
            "auth_type": ov.auth_type,
            "has_username": !ov.username.is_empty(),
            "has_password": !ov.password.is_empty(),
            "has_ca_cert": !ov.ca_cert.is_empty(),
            "has_client_cert": !ov.client_cert.is_empty(),
            "has_client_key": !ov.client_key.is_empty(),
            "has_tls_auth": !ov.tls_auth.is_empty(),
            "cipher": ov.cipher,
            "auth": ov.auth,
            "compress": ov.compress,
            "device_type": ov.device_type,
        });
    }

    Json(response)
}

/// Replace the VPN configuration; blank secret fields keep stored values.
/// The coordinator is restarted with the new settings.
#[utoipa::path(
    put,
    path = "/api/vpn",
    request_body = VpnConfig,
    responses((status = 200, description = "VPN configuration updated"))
)]
pub async fn update_vpn(
    State(state): State<AppState>,
    payload: Result<Json<VpnConfig>, JsonRejection>,
) -> Json<Value> {
    let Json(mut vpn) = match payload {
        Ok(json) => json,
        Err(_) => return error_response("invalid JSON"),
    };

    let existing = state.config.vpn().await;
    if let (Some(new_wg), Some(old_wg)) = (vpn.wireguard.as_mut(), existing.wireguard.as_ref()) {
        if new_wg.private_key.is_empty() {
            new_wg.private_key = old_wg.private_key.clone();
        }
        if new_wg.peer_public_key.is_empty() {
            new_wg.peer_public_key = old_wg.peer_public_key.clone();
        }
        if new_wg.preshared_key.is_empty() {
            new_wg.preshared_key = old_wg.preshared_key.clone();
        }
    }
    if let (Some(new_ov), Some(old_ov)) = (vpn.openvpn.as_mut(), existing.openvpn.as_ref()) {
        if new_ov.username.is_empty() {
            new_ov.username = old_ov.username.clone();
        }
        if new_ov.password.is_empty() {
            new_ov.password = old_ov.password.clone();
        }
        if new_ov.ca_cert.is_empty() {
            new_ov.ca_cert = old_ov.ca_cert.clone();
        }
        if new_ov.client_cert.is_empty() {
            new_ov.client_cert = old_ov.client_cert.clone();
        }
        if new_ov.client_key.is_empty() {
            new_ov.client_key = old_ov.client_key.clone();
        }
        if new_ov.tls_auth.is_empty() {
            new_ov.tls_auth = old_ov.tls_auth.clone();
        }
    }

    let protocol = vpn.protocol.clone();
    state.config.set_vpn(vpn).await;
    if let Err(e) = state.config.save().await {
        warn!(error = %e, "failed to save config");
        return error_response("failed to save config");
    }

    state.vpn.reconfigure().await;
    info!(protocol, "VPN configuration updated");
    Json(json!({ "status": true }))
}

/// Bring the managed tunnel up and remember the decision
#[utoipa::path(
    post,
    path = "/api/vpn/connect",
    responses((status = 200, description = "Connect outcome"))
)]
pub async fn vpn_connect(State(state): State<AppState>) -> Json<Value> {
    if !state.vpn.is_managed() {
        let vpn = state.config.vpn().await;
        if vpn.protocol.is_empty() {
            return error_response(
                "VPN is in passive mode; configure a protocol first, then save",
            );
        }
        // Config was saved but the coordinator not yet restarted
        state.vpn.reconfigure().await;
    }

    if let Err(e) = state.vpn.connect().await {
        return error_response(e.to_string());
    }
    state.config.set_vpn_auto_connect(true).await;
    let _ = state.config.save().await;
    Json(json!({ "status": true }))
}

/// Tear the managed tunnel down and remember the decision, so a restart
/// stays disconnected
#[utoipa::path(
    post,
    path = "/api/vpn/disconnect",
    responses((status = 200, description = "Disconnect outcome"))
)]
pub async fn vpn_disconnect(State(state): State<AppState>) -> Json<Value> {
    if let Err(e) = state.vpn.disconnect().await {
        return error_response(e.to_string());
    }
    state.config.set_vpn_auto_connect(false).await;
    let _ = state.config.save().await;
    Json(json!({ "status": true }))
}

/// Live VPN state
#[utoipa::path(
    get,
    path = "/api/vpn/status",
    responses((status = 200, description = "Current VPN state", body = ConnectorStatus))
)]
pub async fn vpn_status(State(state): State<AppState>) -> Json<Value> {
    let status = state.vpn.status();
    let mut response = json!({
        "state": status.state,
        "interface_name": status.interface_name,
        "error": status.error,
        "managed": state.vpn.is_managed(),
    });
    if let Some(connected_at) = status.connected_at {
        response["connected_at"] = json!(connected_at.to_rfc3339());
        let uptime = (chrono::Utc::now() - connected_at).num_seconds().max(0);
        response["uptime_seconds"] = json!(uptime);
    }
    Json(response)
}

/// Persist the config and push the new server list into the pool manager
async fn save_and_reconcile(state: &AppState) {
    if let Err(e) = state.config.save().await {
        warn!(error = %e, "failed to save config");
    }
    let servers = state.config.servers().await;
    state.pool_manager.update_servers(&servers).await;
}

fn error_response(message: impl Into<String>) -> Json<Value> {
    Json(json!({ "status": false, "error": message.into() }))
}
