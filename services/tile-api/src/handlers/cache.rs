//! Cache index and cache deletion handlers.

use axum::extract::{Extension, Path, Query};
use axum::Json;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use storage::purge_dir;
use tile_common::TileError;

use crate::projects;
use crate::state::AppState;

use super::common::{ApiError, ApiResult};

/// Index-entry fields whose change invalidates the cached tiles.
const PURGE_TRIGGER_FIELDS: [&str; 5] = [
    "resolutions",
    "tileGridId",
    "extent",
    "tile_matrix_set",
    "tile_matrix_preset",
];

/// GET /cache/:project/index.json
pub async fn get_index_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(project): Path<String>,
) -> ApiResult<Json<Value>> {
    let project = projects::resolve_project_id(&project)?;
    let index = state.index.read_augmented(&project);
    Ok(Json(serde_json::to_value(index).map_err(TileError::from)?))
}

/// PATCH /cache/:project/index.json  body: `{layers: {<name>: {...}}}`
///
/// Grid-shaping fields (resolutions, preset binding, extent) purge the
/// target's tile tree because existing tiles no longer match the geometry.
pub async fn patch_index_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(project): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let project = projects::resolve_project_id(&project)?;
    let Some(layers) = body.get("layers").and_then(Value::as_object) else {
        return Ok(Json(json!({ "status": "unchanged" })));
    };

    let mut purged: Vec<String> = Vec::new();
    for (name, patch) in layers {
        let Some(patch) = patch.as_object() else {
            continue;
        };
        let index = state.index.read(&project);
        let Some(existing) = index
            .layers
            .iter()
            .find(|e| &e.name == name)
            .cloned()
        else {
            continue;
        };
        let kind = existing.kind.clone();

        let mut grid_changed = false;
        for field in PURGE_TRIGGER_FIELDS {
            if let Some(incoming) = patch.get(field) {
                let current = match field {
                    "tileGridId" | "tile_matrix_preset" => existing
                        .tile_matrix_preset
                        .clone()
                        .map(Value::String)
                        .unwrap_or(Value::Null),
                    "tile_matrix_set" => {
                        existing.tile_matrix_set.clone().unwrap_or(Value::Null)
                    }
                    "extent" => serde_json::to_value(&existing.extent).unwrap_or(Value::Null),
                    _ => Value::Null,
                };
                if *incoming != current {
                    grid_changed = true;
                }
            }
        }

        state.index.upsert_entry(&project, &kind, name, |mut entry| {
            if let Some(preset) = patch
                .get("tileGridId")
                .or_else(|| patch.get("tile_matrix_preset"))
            {
                entry.tile_matrix_preset =
                    preset.as_str().map(str::to_string);
            }
            if let Some(set) = patch.get("tile_matrix_set") {
                entry.tile_matrix_set = if set.is_null() {
                    None
                } else {
                    Some(set.clone())
                };
            }
            if let Some(extent) = patch.get("extent") {
                entry.extent = serde_json::from_value(extent.clone()).ok();
            }
            if let Some(crs) = patch.get("tile_crs").and_then(Value::as_str) {
                entry.tile_crs = Some(crs.to_string());
            }
            if let Some(cacheable) = patch.get("cacheable").and_then(Value::as_bool) {
                entry.cacheable = Some(cacheable);
            }
            entry
        })?;

        if grid_changed {
            if let Some(dir) =
                state
                    .layout
                    .target_dir(&project, existing.target_kind(), name)
            {
                if purge_dir(&dir).is_ok() {
                    state.index.clear_cache_fields(&project, &kind, name);
                    purged.push(name.clone());
                }
            }
        }
    }

    state.inventory.invalidate();
    Ok(Json(json!({ "status": "updated", "purged": purged })))
}

/// DELETE /cache/:project: purge every cached target of a project.
pub async fn delete_project_cache_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(project): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let project = projects::resolve_project_id(&project)?;
    let force = query.get("force").map(String::as_str) == Some("1");

    let running = state.jobs.jobs_for_target(&project, None);
    if !running.is_empty() {
        if !force {
            return Err(ApiError(TileError::JobRunning(running[0].clone())));
        }
        for id in running {
            state.jobs.abort_job(&id).await?;
        }
    }

    let index = state.index.read(&project);
    let mut deleted: Vec<String> = Vec::new();
    for entry in &index.layers {
        let Some(dir) = state
            .layout
            .target_dir(&project, entry.target_kind(), &entry.name)
        else {
            continue;
        };
        purge_dir(&dir).map_err(|e| {
            ApiError(TileError::CacheDeleteFailed(format!(
                "{}: {}",
                dir.display(),
                e
            )))
        })?;
        state
            .index
            .clear_cache_fields(&project, &entry.kind, &entry.name);
        deleted.push(entry.name.clone());
    }

    state.inventory.invalidate();
    Ok(Json(json!({ "status": "deleted", "targets": deleted })))
}

/// DELETE /cache/:project/:name[?force=1]: purge one target's cache.
pub async fn delete_target_cache_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path((project, name)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let project = projects::resolve_project_id(&project)?;
    let force = query.get("force").map(String::as_str) == Some("1");

    if let Some(job_id) = state.jobs.target_busy(&project, &name) {
        if !force {
            return Err(ApiError(TileError::JobRunning(job_id)));
        }
        state.jobs.abort_job(&job_id).await?;
    }

    // The entry tells us whether this name is a layer or a theme; default
    // to layer when the target was never indexed.
    let index = state.index.read(&project);
    let entry = index.layers.iter().find(|e| e.name == name);
    let (kind, target_kind) = entry
        .map(|e| (e.kind.clone(), e.target_kind()))
        .unwrap_or(("layer".to_string(), storage::TargetKind::Layer));

    let dir = state
        .layout
        .target_dir(&project, target_kind, &name)
        .ok_or_else(|| ApiError(TileError::InvalidCachePath(name.clone())))?;
    purge_dir(&dir).map_err(|e| {
        ApiError(TileError::CacheDeleteFailed(format!(
            "{}: {}",
            dir.display(),
            e
        )))
    })?;
    state.index.clear_cache_fields(&project, &kind, &name);

    state.inventory.invalidate();
    Ok(Json(json!({ "status": "deleted", "target": name })))
}
