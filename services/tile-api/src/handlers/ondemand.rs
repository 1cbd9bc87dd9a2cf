//! On-demand rendering control endpoints.

use axum::extract::{Extension, Query};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::auth::require_admin;
use crate::state::AppState;

use super::common::ApiResult;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SessionAbortBody {
    pub sid: Option<String>,
}

/// POST /on-demand/abort and POST /viewer/abort.
///
/// The sid travels either in the query (sendBeacon) or the body.
pub async fn abort_session_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    body: Option<Json<SessionAbortBody>>,
) -> Json<Value> {
    let sid = query
        .get("sid")
        .cloned()
        .or_else(|| body.and_then(|Json(b)| b.sid));

    match sid.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(sid) => {
            state.ondemand.abort_session(sid);
            state.jobs.abort_jobs_for_session(sid).await;
            Json(json!({ "status": "aborted", "sid": sid }))
        }
        None => Json(json!({ "status": "ignored" })),
    }
}

/// GET /on-demand/status (admin)
pub async fn status_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    require_admin(&state.settings, &headers)?;
    Ok(Json(state.ondemand.status()))
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AbortAllBody {
    pub pause_ms: Option<u64>,
}

/// POST /on-demand/abort-all (admin)
pub async fn abort_all_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<AbortAllBody>>,
) -> ApiResult<Json<Value>> {
    require_admin(&state.settings, &headers)?;
    let pause_ms = body.and_then(|Json(b)| b.pause_ms);
    let applied = state.ondemand.abort_all(pause_ms);
    Ok(Json(json!({ "status": "paused", "pauseMs": applied })))
}
