//! Model catalog, download and instance management endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::path::{Component, PathBuf};
use tracing::info;

use crate::catalog;
use crate::error::{GatewayError, Result};
use crate::lifecycle::EnsureOptions;
use crate::shared_state::AppState;

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
    pub limit: Option<usize>,
    #[serde(default)]
    pub include_restricted: bool,
}

/// GET /models/search
pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse> {
    let query = catalog::search_query(&params.q, params.limit, params.include_restricted)?;
    let models = state.resolver().search(&query).await?;
    Ok(Json(json!({
        "query": query.text,
        "count": models.len(),
        "models": models,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    pub repo: String,
    pub filename: String,
    /// Path under the download directory; a trailing `/` names a directory
    pub destination: Option<String>,
}

/// POST /models/download
///
/// Starts (or joins) the transfer and returns at once; the download keeps
/// running after the response is sent.
pub async fn download(
    State(state): State<AppState>,
    Json(req): Json<DownloadRequest>,
) -> Result<impl IntoResponse> {
    let raw = format!("{}:{}", req.repo.trim(), req.filename.trim());
    let entry = state.resolver().resolve(&raw).await?;
    let entry = match req.destination.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        Some(destination) => {
            // Shards must keep their names for the engine to find them.
            let as_dir = entry.is_split();
            let path = destination_path(&state.config.download_dir, destination, &entry.file, as_dir)?;
            entry.with_destination(path)
        }
        None => (*entry).clone(),
    };

    let ticket = state.downloads().ensure_local(&entry).await?;
    let id = ticket.id().to_string();
    let status = ticket.progress().status;
    info!("Download {} for {} -> {}", id, entry.resolved_id, entry.destination.display());
    ticket.keep_in_background();

    let mut body = json!({
        "downloadId": id,
        "status": status,
        "filePath": entry.destination,
    });
    if entry.is_split() {
        let mut shard_ids = Vec::with_capacity(entry.companions.len());
        for shard in &entry.companions {
            let ticket = state.downloads().ensure_local(shard).await?;
            shard_ids.push(ticket.id().to_string());
            ticket.keep_in_background();
        }
        info!("Download {} also fetches {} more shards", id, shard_ids.len());
        body["shardDownloadIds"] = json!(shard_ids);
    }

    Ok((StatusCode::ACCEPTED, Json(body)))
}

/// Keep caller-supplied destinations inside the download directory.
fn destination_path(root: &std::path::Path, destination: &str, file: &str, as_dir: bool) -> Result<PathBuf> {
    let relative = std::path::Path::new(destination);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if escapes {
        return Err(GatewayError::InvalidRequest(format!(
            "destination must be a relative path inside the download directory: {}",
            destination
        )));
    }
    let mut path = root.join(relative);
    if as_dir || destination.ends_with('/') || path.is_dir() {
        let name = std::path::Path::new(file)
            .file_name()
            .ok_or_else(|| GatewayError::InvalidRequest(format!("bad file name {}", file)))?;
        path.push(name);
    }
    Ok(path)
}

/// GET /models/downloads
pub async fn list_downloads(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "downloads": state.downloads().list() }))
}

/// GET /models/downloads/:id
pub async fn get_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    state
        .downloads()
        .get(&id)
        .map(Json)
        .ok_or_else(|| GatewayError::NotFound(format!("download {}", id)))
}

/// DELETE /models/downloads/:id
pub async fn cancel_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    state.downloads().cancel(&id)?;
    Ok(Json(json!({ "downloadId": id, "status": "canceled" })))
}

/// POST /models/downloads/:id/pause
pub async fn pause_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.downloads().pause(&id)?))
}

/// POST /models/downloads/:id/resume
pub async fn resume_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.downloads().resume(&id)?))
}

/// GET /models/loaded
pub async fn loaded(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "models": state.lifecycle.list(),
        "devices": state.gpus().inventory(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct LoadRequest {
    pub model_id: String,
    #[serde(default)]
    pub auto_unload: bool,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub gpu_ids: Vec<usize>,
}

/// POST /models/load
///
/// Blocks until the instance serves, then drops the reference it took, so
/// the instance stays warm but unreferenced.
pub async fn load(
    State(state): State<AppState>,
    Json(req): Json<LoadRequest>,
) -> Result<impl IntoResponse> {
    let device_count = state.gpus().inventory().len();
    if let Some(bad) = req.gpu_ids.iter().find(|&&id| id >= device_count) {
        return Err(GatewayError::InvalidRequest(format!(
            "unknown GPU {} ({} device(s) available)",
            bad, device_count
        )));
    }

    let opts = EnsureOptions {
        auto_unload: req.auto_unload,
        pinned: req.pinned,
        preferred_gpu: req.gpu_ids.first().copied(),
    };
    let lease = state.lifecycle.ensure_ready(&req.model_id, opts).await?;
    let key = lease.identifier().to_string();
    lease.release();

    let summary = state
        .lifecycle
        .list()
        .into_iter()
        .find(|s| s.identifier == key);
    Ok(Json(json!({
        "status": "ready",
        "modelId": key,
        "instance": summary,
    })))
}

#[derive(Debug, Deserialize)]
pub struct UnloadRequest {
    pub model_id: String,
    /// Caller confirms no requests are in flight
    #[serde(default)]
    pub force: bool,
}

/// POST /models/unload
pub async fn unload(
    State(state): State<AppState>,
    Json(req): Json<UnloadRequest>,
) -> Result<impl IntoResponse> {
    let outcome = state.lifecycle.unload(&req.model_id, req.force).await?;
    Ok(Json(json!({
        "modelId": req.model_id,
        "status": outcome,
    })))
}
