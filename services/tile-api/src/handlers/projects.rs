//! Project listing, deletion, config, and batch-run handlers.

use axum::extract::{Extension, Path};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tile_common::TileError;

use crate::auth::require_admin;
use crate::config_store::build_project_config_patch;
use crate::projects;
use crate::state::AppState;

use super::common::{ApiError, ApiResult};

/// GET /projects
pub async fn list_projects_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<Vec<projects::ProjectInfo>> {
    Json(projects::list_projects(&state.settings))
}

/// DELETE /projects/:id (admin)
pub async fn delete_project_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    require_admin(&state.settings, &headers)?;
    projects::delete_project(
        &id,
        &state.settings,
        &state.layout,
        &state.jobs,
        &state.scheduler,
        &state.config,
        &state.log,
    )
    .await?;
    state.inventory.invalidate();
    Ok(Json(json!({ "status": "deleted", "id": id })))
}

/// GET /projects/:id/config
pub async fn get_config_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let id = projects::resolve_project_id(&id)?;
    if !projects::project_exists(&state.settings, &state.layout, &id) {
        return Err(ApiError(TileError::ProjectNotFound(id)));
    }
    let cfg = state.config.read(&id);
    Ok(Json(serde_json::to_value(cfg).map_err(TileError::from)?))
}

/// PATCH /projects/:id/config
pub async fn patch_config_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let id = projects::resolve_project_id(&id)?;
    if !projects::project_exists(&state.settings, &state.layout, &id) {
        return Err(ApiError(TileError::ProjectNotFound(id)));
    }
    let patch = build_project_config_patch(&body);
    let updated = state.config.update(&id, patch)?;
    Ok(Json(serde_json::to_value(updated).map_err(TileError::from)?))
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct BatchRequest {
    pub layers: Option<Vec<String>>,
    pub reason: Option<String>,
    pub run_id: Option<String>,
}

/// GET /projects/:id/cache/project
pub async fn get_project_batch_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let id = projects::resolve_project_id(&id)?;
    let cfg = state.config.read(&id);
    Ok(Json(json!({
        "batch": state.scheduler.batch_for(&id),
        "lastResult": cfg.project_cache.last_result,
        "history": cfg.project_cache.history,
    })))
}

/// POST /projects/:id/cache/project
pub async fn post_project_batch_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<BatchRequest>>,
) -> ApiResult<Json<Value>> {
    let id = projects::resolve_project_id(&id)?;
    if !projects::project_exists(&state.settings, &state.layout, &id) {
        return Err(ApiError(TileError::ProjectNotFound(id)));
    }
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let reason = req.reason.as_deref().unwrap_or("manual-project");
    let batch = state.scheduler.run_recache_for_project(
        &id,
        req.layers,
        reason,
        "manual",
        req.run_id,
    )?;
    Ok(Json(json!({ "status": "started", "batch": batch })))
}
