//! WMTS handlers: GetCapabilities, KVP and REST GetTile, and the legacy
//! `/wmts/:project/:name/:z/:x/:y.png` tile routes.

use axum::extract::{Extension, Path, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use ogc_protocol::{wmts_exception, WmtsCapabilitiesBuilder, WmtsKvpParams};
use std::collections::HashMap;
use std::sync::Arc;
use storage::{tile_file_status, TargetKind, TileFileStatus};
use tile_common::{TileCoord, TileError};
use tracing::info;

use crate::inventory::{InventoryLayer, ResolvedMatrix};
use crate::ondemand::TileRenderParams;
use crate::projects;
use crate::state::AppState;

use super::common::{base_url, tile_response, xml_response, ApiError};

/// GET /wmts, the KVP binding: GetCapabilities and GetTile.
pub async fn wmts_kvp_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(raw): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let params = WmtsKvpParams::from_query(&raw);
    let request = params
        .request
        .as_deref()
        .unwrap_or("GetCapabilities")
        .to_ascii_lowercase();

    match request.as_str() {
        "getcapabilities" => capabilities_response(&state, &params, &headers),
        "gettile" => kvp_get_tile(&state, &params).await,
        other => xml_response(
            StatusCode::BAD_REQUEST,
            wmts_exception(
                "OperationNotSupported",
                &format!("Unknown request: {}", other),
            ),
        ),
    }
}

fn capabilities_response(
    state: &Arc<AppState>,
    params: &WmtsKvpParams,
    headers: &HeaderMap,
) -> Response {
    let inventory = state.inventory.get();
    let layers = inventory.wmts_layers(params.project.as_deref(), params.layer.as_deref());
    let matrix_sets = inventory.wmts_matrix_sets(&layers);

    let builder = WmtsCapabilitiesBuilder {
        service: state.inventory.service_metadata(),
        base_url: base_url(&state.settings, headers),
        layers,
        matrix_sets,
    };
    xml_response(StatusCode::OK, builder.build())
}

async fn kvp_get_tile(state: &Arc<AppState>, params: &WmtsKvpParams) -> Response {
    let Some(requested_layer) = params.layer.as_deref() else {
        return xml_response(
            StatusCode::BAD_REQUEST,
            wmts_exception("MissingParameterValue", "LAYER is required"),
        );
    };
    let (Some(row), Some(col)) = (params.tile_row, params.tile_col) else {
        return xml_response(
            StatusCode::BAD_REQUEST,
            wmts_exception("MissingParameterValue", "TILEROW and TILECOL are required"),
        );
    };
    if row < 0 || col < 0 {
        return ApiError(TileError::TileNotFound).into_response();
    }
    let Some(requested_matrix) = params.normalized_tile_matrix() else {
        return xml_response(
            StatusCode::BAD_REQUEST,
            wmts_exception("MissingParameterValue", "TILEMATRIX is required"),
        );
    };

    let inventory = state.inventory.get();
    let Some(layer) = inventory.find_kvp(requested_layer) else {
        return ApiError(TileError::TileNotFound).into_response();
    };
    let Some(matrices) = inventory.matrices_for(&layer.set_id) else {
        return ApiError(TileError::TileNotFound).into_response();
    };

    let (matrix, col, mut row) =
        match resolve_kvp_matrix(matrices, &requested_matrix, col as u64, row as u64) {
            Some(resolved) => resolved,
            None => return ApiError(TileError::TileNotFound).into_response(),
        };

    // Out-of-bounds indices may be TMS-origin; try the row flip once.
    if col >= matrix.matrix_width as u64 || row >= matrix.matrix_height as u64 {
        match (matrix.matrix_height as u64).checked_sub(1 + row) {
            Some(flipped_row) if col < matrix.matrix_width as u64 => {
                info!(
                    layer = %layer.identifier,
                    row,
                    flipped_row,
                    "TMS origin flip applied to tile request"
                );
                row = flipped_row;
            }
            _ => return ApiError(TileError::TileNotFound).into_response(),
        }
    }

    let cache_control = format!(
        "public, max-age={}",
        state.settings.wmts_tile_cache_max_age_s
    );
    serve_tile(
        state,
        layer,
        &matrix,
        col as u32,
        row as u32,
        params.sid.clone(),
        &cache_control,
    )
    .await
}

/// Locate the requested matrix; a numeric request with no exact match is
/// remapped to the nearest available level with the col/row scaled by
/// `2^(target-requested)`.
fn resolve_kvp_matrix(
    matrices: &[ResolvedMatrix],
    requested: &str,
    col: u64,
    row: u64,
) -> Option<(ResolvedMatrix, u64, u64)> {
    if let Some(matrix) = matrices.iter().find(|m| m.identifier == requested) {
        return Some((matrix.clone(), col, row));
    }

    let requested_zoom: i64 = requested.parse().ok()?;
    let nearest = matrices
        .iter()
        .filter_map(|m| {
            m.identifier
                .parse::<i64>()
                .ok()
                .map(|z| (m, (z - requested_zoom).abs(), z))
        })
        .min_by_key(|(_, distance, _)| *distance)?;
    let (matrix, _, target_zoom) = nearest;

    let shift = target_zoom - requested_zoom;
    let (col, row) = if shift >= 0 {
        (col << shift, row << shift)
    } else {
        (col >> (-shift), row >> (-shift))
    };
    info!(
        requested = requested_zoom,
        target = target_zoom,
        "Remapped TileMatrix to nearest available level"
    );
    Some((matrix.clone(), col, row))
}

/// GET /wmts/rest/:project/:layer/:style/:set/:matrix/:row/:col.png
pub async fn wmts_rest_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path((project_key, layer_key, _style, set_id, tile_matrix, tile_row, tile_col)): Path<(
        String,
        String,
        String,
        String,
        String,
        String,
        String,
    )>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let Some((col_str, ext)) = tile_col.rsplit_once('.') else {
        return ApiError(TileError::TileNotFound).into_response();
    };
    if ext != "png" {
        return ApiError(TileError::TileNotFound).into_response();
    }
    let (Ok(row), Ok(col)) = (tile_row.parse::<i64>(), col_str.parse::<i64>()) else {
        return ApiError(TileError::TileNotFound).into_response();
    };
    if row < 0 || col < 0 {
        return (StatusCode::BAD_REQUEST, "negative tile index").into_response();
    }

    let inventory = state.inventory.get();
    let Some(layer) = inventory.find_rest(&project_key, &layer_key) else {
        return ApiError(TileError::TileNotFound).into_response();
    };
    if layer.set_id != set_id {
        return ApiError(TileError::TileNotFound).into_response();
    }
    let Some(matrix) = inventory.matrix(&layer.set_id, &tile_matrix).cloned() else {
        return ApiError(TileError::TileNotFound).into_response();
    };
    if col as u64 >= matrix.matrix_width as u64 || row as u64 >= matrix.matrix_height as u64 {
        return ApiError(TileError::TileNotFound).into_response();
    }

    let cache_control = format!(
        "public, max-age={}",
        state.settings.wmts_tile_cache_max_age_s
    );
    serve_tile(
        &state,
        layer,
        &matrix,
        col as u32,
        row as u32,
        query.get("sid").cloned(),
        &cache_control,
    )
    .await
}

/// Serve from the cache tree, falling back to an on-demand render. Invalid
/// files are deleted before rendering so they can never be served.
async fn serve_tile(
    state: &Arc<AppState>,
    layer: &InventoryLayer,
    matrix: &ResolvedMatrix,
    col: u32,
    row: u32,
    sid: Option<String>,
    cache_control: &str,
) -> Response {
    let Some(path) = state.layout.tile_path(
        &layer.project,
        layer.target_kind(),
        &layer.name,
        matrix.source_level,
        col,
        row,
        "png",
    ) else {
        return ApiError(TileError::InvalidCachePath(layer.name.clone())).into_response();
    };

    match tile_file_status(&path, state.settings.min_tile_bytes) {
        TileFileStatus::Valid => tile_response(&path, cache_control),
        status => {
            if status == TileFileStatus::Invalid {
                let _ = std::fs::remove_file(&path);
            }
            let params = TileRenderParams {
                project: layer.project.clone(),
                mode: layer.kind.clone(),
                name: layer.name.clone(),
                coord: TileCoord::new(matrix.source_level, col, row),
                output_file: path.clone(),
                tile_crs: layer.tile_crs.to_string(),
                bbox: Some(matrix.tile_bbox(col, row)),
                tile_matrix_preset: layer.preset_id.clone(),
                sid,
            };
            match state.ondemand.queue_tile_render(params).await {
                Ok(rendered) => tile_response(&rendered, cache_control),
                Err(e) => ApiError(e).into_response(),
            }
        }
    }
}

/// GET /wmts/:project/:name/:z/:x/:y.png, the legacy direct tile route.
pub async fn legacy_tile_handler(
    state: Extension<Arc<AppState>>,
    Path((project, name, z, x, y_ext)): Path<(String, String, u32, u32, String)>,
    query: Query<HashMap<String, String>>,
) -> Response {
    legacy_tile(state, project, name, z, x, y_ext, query, false).await
}

/// GET /wmts/:project/themes/:name/:z/:x/:y.png
pub async fn legacy_theme_tile_handler(
    state: Extension<Arc<AppState>>,
    Path((project, name, z, x, y_ext)): Path<(String, String, u32, u32, String)>,
    query: Query<HashMap<String, String>>,
) -> Response {
    legacy_tile(state, project, name, z, x, y_ext, query, true).await
}

async fn legacy_tile(
    Extension(state): Extension<Arc<AppState>>,
    project: String,
    name: String,
    z: u32,
    x: u32,
    y_ext: String,
    Query(query): Query<HashMap<String, String>>,
    theme: bool,
) -> Response {
    let Some((y_str, ext)) = y_ext.rsplit_once('.') else {
        return ApiError(TileError::TileNotFound).into_response();
    };
    if ext != "png" {
        return ApiError(TileError::TileNotFound).into_response();
    }
    let Ok(y) = y_str.parse::<u32>() else {
        return ApiError(TileError::TileNotFound).into_response();
    };
    let Ok(project) = projects::resolve_project_id(&project) else {
        return ApiError(TileError::TileNotFound).into_response();
    };

    // A viewer may request a theme name that is actually configured as a
    // layer; fall back rather than 404.
    let mut kind = if theme { "theme" } else { "layer" };
    if theme {
        let cfg = state.config.read(&project);
        if !cfg.themes.contains_key(&name) && cfg.layers.contains_key(&name) {
            info!(project = %project, name = %name, "Theme request served from layer cache");
            kind = "layer";
        }
    }
    let target_kind = if kind == "theme" {
        TargetKind::Theme
    } else {
        TargetKind::Layer
    };

    let Some(path) = state
        .layout
        .tile_path(&project, target_kind, &name, z, x, y, "png")
    else {
        return ApiError(TileError::InvalidCachePath(name)).into_response();
    };

    match tile_file_status(&path, state.settings.min_tile_bytes) {
        TileFileStatus::Valid => tile_response(&path, "no-cache"),
        status => {
            if status == TileFileStatus::Invalid {
                let _ = std::fs::remove_file(&path);
            }
            let entry = state.index.read(&project).entry(kind, &name).cloned();
            let tile_crs = entry
                .as_ref()
                .and_then(|e| e.tile_crs.clone())
                .unwrap_or_else(|| "EPSG:3857".to_string());
            let params = TileRenderParams {
                project,
                mode: kind.to_string(),
                name,
                coord: TileCoord::new(z, x, y),
                output_file: path,
                tile_crs,
                bbox: None,
                tile_matrix_preset: entry.and_then(|e| e.tile_matrix_preset),
                sid: query.get("sid").cloned(),
            };
            match state.ondemand.queue_tile_render(params).await {
                Ok(rendered) => tile_response(&rendered, "no-cache"),
                Err(e) => ApiError(e).into_response(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrices(zooms: &[u32]) -> Vec<ResolvedMatrix> {
        zooms
            .iter()
            .map(|z| {
                let n = 2u32.pow(*z);
                ResolvedMatrix {
                    identifier: z.to_string(),
                    source_level: *z,
                    matrix_width: n,
                    matrix_height: n,
                    resolution: 156543.03392804097 / n as f64,
                    bbox_origin: (-20037508.342789244, 20037508.342789244),
                    tile_width: 256,
                    tile_height: 256,
                }
            })
            .collect()
    }

    #[test]
    fn test_exact_matrix_match() {
        let set = matrices(&[0, 1, 2, 3]);
        let (matrix, col, row) = resolve_kvp_matrix(&set, "2", 1, 3).unwrap();
        assert_eq!(matrix.identifier, "2");
        assert_eq!((col, row), (1, 3));
    }

    #[test]
    fn test_remap_up_to_nearest_level() {
        // Requested zoom 5 but only 0..=3 available: remap to 3, divide by 4.
        let set = matrices(&[0, 1, 2, 3]);
        let (matrix, col, row) = resolve_kvp_matrix(&set, "5", 20, 12).unwrap();
        assert_eq!(matrix.identifier, "3");
        assert_eq!((col, row), (5, 3));
    }

    #[test]
    fn test_remap_down_scales_indices() {
        // Requested zoom 1 but only 3..=4 available: remap to 3, multiply by 4.
        let set = matrices(&[3, 4]);
        let (matrix, col, row) = resolve_kvp_matrix(&set, "1", 1, 1).unwrap();
        assert_eq!(matrix.identifier, "3");
        assert_eq!((col, row), (4, 4));
    }

    #[test]
    fn test_remap_is_deterministic() {
        let set = matrices(&[0, 2, 4]);
        let a = resolve_kvp_matrix(&set, "3", 6, 2).unwrap();
        let b = resolve_kvp_matrix(&set, "3", 6, 2).unwrap();
        assert_eq!(a.0.identifier, b.0.identifier);
        assert_eq!((a.1, a.2), (b.1, b.2));
    }

    #[test]
    fn test_non_numeric_unknown_matrix_rejected() {
        let set = matrices(&[0, 1]);
        assert!(resolve_kvp_matrix(&set, "level-9", 0, 0).is_none());
    }
}
