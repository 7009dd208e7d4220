use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::{GatewayError, Result};
use crate::shared_state::AppState;
use crate::stats::GLOBAL_KEY;

#[derive(Debug, Deserialize)]
pub struct ModelFilter {
    pub model: Option<String>,
}

/// Stats are keyed by canonical identifier; accept any spelling of it.
fn stats_key(state: &AppState, raw: &str) -> Result<String> {
    if raw == GLOBAL_KEY {
        return Ok(raw.to_string());
    }
    Ok(state.resolver().parse(raw)?.to_string())
}

/// GET /activity/stats
pub async fn get_stats(
    State(state): State<AppState>,
    Query(filter): Query<ModelFilter>,
) -> Result<impl IntoResponse> {
    let snapshot = state.stats.snapshot();
    match filter.model.as_deref() {
        None => Ok(Json(
            serde_json::to_value(&*snapshot).map_err(|e| GatewayError::Internal(e.to_string()))?,
        )),
        Some(raw) => {
            let key = stats_key(&state, raw)?;
            let stats = snapshot
                .get(&key)
                .ok_or_else(|| GatewayError::NotFound(format!("no activity for {}", key)))?;
            Ok(Json(json!({ "model": key, "stats": stats })))
        }
    }
}

/// DELETE /activity/stats
pub async fn reset_stats(
    State(state): State<AppState>,
    Query(filter): Query<ModelFilter>,
) -> Result<impl IntoResponse> {
    let key = match filter.model.as_deref() {
        Some(raw) => Some(stats_key(&state, raw)?),
        None => None,
    };
    state.stats.reset(key.as_deref());
    state.stats.flush().await;
    Ok(Json(json!({ "reset": key.unwrap_or_else(|| "all".into()) })))
}
