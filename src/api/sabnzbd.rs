//! SABnzbd-compatible `/api` endpoint
//!
//! Speaks the subset of the SABnzbd JSON API that download automation
//! tools use: `mode=queue`, `mode=history`, `mode=status`/`fullstatus`,
//! `mode=version`, and the `addfile`/`addurl` ingestion modes. Responses
//! follow SABnzbd conventions: HTTP 200 with `{"status": false, "error":
//! ...}` on failure.

use super::AppState;
use crate::nzb::{format_size, Nzb};
use crate::queue::{Download, NewDownload};
use crate::types::DownloadId;
use axum::extract::{Multipart, Query, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::{Json, RequestExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

/// Version string reported to SABnzbd clients
const SABNZBD_VERSION: &str = "4.0.0";
/// Timeout for `mode=addurl` fetches
const NZB_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// `GET /api` dispatch on `mode`
pub async fn handle_get(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let mode = params.get("mode").map(String::as_str).unwrap_or_default();
    match mode {
        "queue" => get_queue(&state).await,
        "history" => get_history(&state).await,
        "status" | "fullstatus" => get_status(&state).await,
        "version" => Json(json!({ "version": SABNZBD_VERSION })),
        other => Json(json!({ "status": true, "mode": other })),
    }
}

/// `POST /api` — NZB ingestion.
///
/// `mode=addfile` arrives as multipart (`nzbfile` upload, optional `cat`),
/// `mode=addurl` as a form (`name` or `value` field). A POST without an
/// explicit mode is treated by content type: multipart as a file upload,
/// form as a URL.
pub async fn handle_post(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    request: Request,
) -> Json<Value> {
    let query_mode = params.get("mode").cloned().unwrap_or_default();

    let is_multipart = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("multipart/form-data"))
        .unwrap_or(false);

    if is_multipart {
        let multipart = match request.extract::<Multipart, _>().await {
            Ok(multipart) => multipart,
            Err(e) => return error_response(format!("invalid multipart body: {e}")),
        };
        return add_nzb_file(&state, multipart).await;
    }

    let form: HashMap<String, String> = match request
        .extract::<axum::extract::Form<HashMap<String, String>>, _>()
        .await
    {
        Ok(axum::extract::Form(form)) => form,
        Err(_) => HashMap::new(),
    };

    let mode = if query_mode.is_empty() {
        form.get("mode").cloned().unwrap_or_default()
    } else {
        query_mode
    };

    match mode.as_str() {
        "addfile" => error_response("no NZB file or URL provided"),
        _ => {
            let url = form
                .get("name")
                .or_else(|| form.get("value"))
                .cloned()
                .unwrap_or_default();
            if url.is_empty() {
                return error_response("no NZB file or URL provided");
            }
            let category = form_category(&form);
            add_nzb_url(&state, &url, category).await
        }
    }
}

async fn get_queue(state: &AppState) -> Json<Value> {
    let downloads = match state.store.queue().await {
        Ok(downloads) => downloads,
        Err(e) => return error_response(e.to_string()),
    };

    let slots: Vec<Value> = downloads.iter().map(|dl| queue_slot(state, dl)).collect();
    let speed_kb = state.engine.current_speed() as f64 / 1024.0;

    Json(json!({
        "queue": {
            "paused": state.store.is_paused(),
            "slots": slots,
            "speed": format!("{speed_kb:.0}"),
            "noofslots": slots.len(),
        }
    }))
}

fn queue_slot(state: &AppState, dl: &Download) -> Value {
    let remaining = (dl.total_bytes - dl.downloaded_bytes).max(0);
    let extract = state.store.extract_progress(&dl.id).unwrap_or_default();
    json!({
        "nzo_id": dl.id,
        "filename": dl.name,
        "cat": dl.category,
        "status": dl.status().as_sabnzbd_queue(),
        "mb": format!("{:.2}", dl.total_bytes as f64 / 1024.0 / 1024.0),
        "mbleft": format!("{:.2}", remaining as f64 / 1024.0 / 1024.0),
        "percentage": format!("{:.0}", dl.progress()),
        "size": format_size(dl.total_bytes.max(0) as u64),
        "sizeleft": format_size(remaining as u64),
        "timeleft": "unknown",
        "extract_pct": format!("{:.0}", extract.percent),
        "extract_file": extract.file,
    })
}

async fn get_history(state: &AppState) -> Json<Value> {
    let downloads = match state.store.history().await {
        Ok(downloads) => downloads,
        Err(e) => return error_response(e.to_string()),
    };

    let slots: Vec<Value> = downloads
        .iter()
        .map(|dl| {
            let completed = dl.completed_at.unwrap_or(0);
            let download_time = if completed > 0 {
                (completed - dl.created_at).max(0)
            } else {
                0
            };
            json!({
                "nzo_id": dl.id,
                "name": dl.name,
                "category": dl.category,
                "status": dl.status().as_sabnzbd_history(),
                "fail_message": dl.error_msg,
                "storage": dl.path,
                "bytes": dl.total_bytes,
                "download_time": download_time,
                "completed": completed,
            })
        })
        .collect();

    Json(json!({
        "history": {
            "slots": slots,
            "noofslots": slots.len(),
        }
    }))
}

async fn get_status(state: &AppState) -> Json<Value> {
    let speed_kb = state.engine.current_speed() as f64 / 1024.0;
    let queue = state.store.queue().await.unwrap_or_default();
    let remaining_mb: f64 = queue
        .iter()
        .map(|dl| (dl.total_bytes - dl.downloaded_bytes).max(0) as f64 / 1024.0 / 1024.0)
        .sum();

    Json(json!({
        "status": {
            "paused": state.store.is_paused(),
            "speed": format!("{speed_kb:.0}"),
            "kbpersec": format!("{speed_kb:.2}"),
            "mbleft": format!("{remaining_mb:.2}"),
            "noofslots_total": queue.len(),
            "version": SABNZBD_VERSION,
            "vpn_connected": state.vpn.is_up(),
            "vpn_interface": state.vpn.interface_name(),
        }
    }))
}

async fn add_nzb_file(state: &AppState, mut multipart: Multipart) -> Json<Value> {
    let mut nzb_data: Option<Vec<u8>> = None;
    let mut filename = String::new();
    let mut category = String::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return error_response(format!("read error: {e}")),
        };
        match field.name().unwrap_or_default() {
            "nzbfile" => {
                filename = field.file_name().unwrap_or("download").to_string();
                match field.bytes().await {
                    Ok(bytes) => nzb_data = Some(bytes.to_vec()),
                    Err(e) => return error_response(format!("read error: {e}")),
                }
            }
            "cat" | "category" => {
                if category.is_empty() {
                    category = field.text().await.unwrap_or_default();
                }
            }
            _ => {}
        }
    }

    let Some(data) = nzb_data else {
        return error_response("no file uploaded");
    };
    let name = filename.trim_end_matches(".nzb").to_string();
    add_download(state, &name, &category, data).await
}

async fn add_nzb_url(state: &AppState, url: &str, category: String) -> Json<Value> {
    let client = match reqwest::Client::builder().timeout(NZB_FETCH_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => return error_response(format!("HTTP client error: {e}")),
    };

    let response = match client.get(url).send().await {
        Ok(response) => response,
        Err(e) => return error_response(format!("download error: {e}")),
    };
    if !response.status().is_success() {
        return error_response(format!("download error: HTTP {}", response.status()));
    }
    let data = match response.bytes().await {
        Ok(data) => data.to_vec(),
        Err(e) => return error_response(format!("read error: {e}")),
    };

    let name = url
        .rsplit('/')
        .next()
        .unwrap_or("")
        .trim_end_matches(".nzb");
    let name = if name.is_empty() { "download" } else { name };

    add_download(state, name, &category, data).await
}

async fn add_download(
    state: &AppState,
    name: &str,
    category: &str,
    data: Vec<u8>,
) -> Json<Value> {
    // Validate up front and precompute the job totals
    let plan = match Nzb::parse(&data) {
        Ok(plan) => plan,
        Err(e) => {
            warn!(name, error = %e, "rejected NZB");
            return error_response(e.to_string());
        }
    };

    let id = DownloadId::generate();
    let new = NewDownload {
        id: id.clone(),
        name: sanitize_job_name(name),
        category: category.to_string(),
        total_bytes: plan.total_bytes() as i64,
        total_segments: plan.total_segments() as i64,
        raw_nzb: data,
    };

    if let Err(e) = state.store.add(&new).await {
        return error_response(e.to_string());
    }
    state.engine.notify();

    info!(
        download_id = %id,
        name = %new.name,
        files = plan.files.len(),
        segments = plan.total_segments(),
        "NZB accepted"
    );

    Json(json!({
        "status": true,
        "nzo_ids": [id.as_str()],
    }))
}

fn form_category(form: &HashMap<String, String>) -> String {
    form.get("cat")
        .or_else(|| form.get("category"))
        .cloned()
        .unwrap_or_default()
}

/// Job names become directory names under the incomplete root; keep them
/// to a single safe path component.
fn sanitize_job_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').to_string();
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}

fn error_response(message: impl Into<String>) -> Json<Value> {
    Json(json!({ "status": false, "error": message.into() }))
}
