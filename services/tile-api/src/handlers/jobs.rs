//! Generate-cache job handlers: admission, status, abort, orphan admin.

use axum::extract::{Extension, Path, Query};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tile_common::TileError;

use crate::auth::require_admin;
use crate::jobs::{GenerateCacheRequest, PidRecord};
use crate::projects;
use crate::state::AppState;

use super::common::{ApiError, ApiResult};

/// POST /generate-cache
pub async fn generate_cache_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<GenerateCacheRequest>,
) -> ApiResult<Json<Value>> {
    let started = state.jobs.start_job(req).await?;
    Ok(Json(serde_json::to_value(started).map_err(TileError::from)?))
}

/// GET /generate-cache/running
pub async fn running_jobs_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<Value> {
    Json(json!({ "jobs": state.jobs.running_snapshots() }))
}

/// GET /generate-cache/:id[?tail=N]
pub async fn job_status_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let tail = query
        .get("tail")
        .and_then(|v| v.parse().ok())
        .unwrap_or(20usize);

    if let Some(snapshot) = state.jobs.job_snapshot(&id, tail) {
        return Ok(Json(snapshot));
    }

    // Not ours: another worker may own it; the pid record is the shared
    // source of truth.
    let path = state.settings.job_pids_dir().join(format!("{}.json", id));
    if let Ok(raw) = std::fs::read_to_string(&path) {
        if let Ok(record) = serde_json::from_str::<PidRecord>(&raw) {
            let alive = crate::procs::pid_alive(record.pid);
            return Ok(Json(json!({
                "id": record.id,
                "project": record.project,
                "target": record.target_name,
                "targetMode": record.target_mode,
                "status": if alive { "running" } else { "unknown" },
                "pid": record.pid,
                "startedAt": record.started_at,
                "foreign": true,
            })));
        }
    }
    Err(ApiError(TileError::JobNotFound(id)))
}

/// DELETE /generate-cache/:id
pub async fn abort_job_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.jobs.abort_job(&id).await?;
    Ok(Json(json!({ "status": "aborted", "id": id })))
}

/// POST /generate-cache/:id/abort: alias for browser `sendBeacon`, which
/// can only POST.
pub async fn abort_job_post_handler(
    state: Extension<Arc<AppState>>,
    id: Path<String>,
) -> ApiResult<Json<Value>> {
    abort_job_handler(state, id).await
}

/// DELETE /generate-cache/abort-all/:project[/:layer]
pub async fn abort_all_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(params): Path<Vec<(String, String)>>,
) -> ApiResult<Json<Value>> {
    let mut project = None;
    let mut layer = None;
    for (key, value) in params {
        match key.as_str() {
            "project" => project = Some(value),
            "layer" => layer = Some(value),
            _ => {}
        }
    }
    let project = projects::resolve_project_id(project.as_deref().unwrap_or(""))?;

    let ids = state.jobs.jobs_for_target(&project, layer.as_deref());
    let mut aborted = Vec::new();
    for id in ids {
        state.jobs.abort_job(&id).await?;
        aborted.push(id);
    }
    Ok(Json(json!({ "status": "aborted", "ids": aborted })))
}

/// GET /generate-cache/admin/orphans (admin)
pub async fn list_orphans_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    require_admin(&state.settings, &headers)?;
    state.jobs.scan_orphans();
    Ok(Json(json!({ "orphans": state.jobs.list_orphans() })))
}

/// POST /generate-cache/admin/orphans/:id/kill (admin)
pub async fn kill_orphan_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    require_admin(&state.settings, &headers)?;
    state.jobs.kill_orphan(&id).await?;
    Ok(Json(json!({ "status": "killed", "id": id })))
}

/// POST /generate-cache/admin/:id/diagnose[?kill=1] (admin)
pub async fn diagnose_job_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    require_admin(&state.settings, &headers)?;
    let diagnosis = state.jobs.diagnose(&id);
    if query.get("kill").map(String::as_str) == Some("1") {
        state.jobs.abort_job(&id).await?;
        return Ok(Json(json!({ "diagnosis": diagnosis, "killed": true })));
    }
    Ok(Json(json!({ "diagnosis": diagnosis })))
}

/// POST /admin/restart-workers (admin): asks the cluster supervisor to
/// replace every worker.
pub async fn restart_workers_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    require_admin(&state.settings, &headers)?;
    crate::cluster::request_restart_all();
    Ok(Json(json!({ "status": "restarting" })))
}

#[derive(Debug, Deserialize)]
pub struct KillPidRequest {
    pub pid: u32,
}

/// POST /admin/kill-pid (admin)
pub async fn kill_pid_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<KillPidRequest>,
) -> ApiResult<Json<Value>> {
    require_admin(&state.settings, &headers)?;
    state.jobs.kill_pid(req.pid)?;
    Ok(Json(json!({ "status": "killed", "pid": req.pid })))
}
