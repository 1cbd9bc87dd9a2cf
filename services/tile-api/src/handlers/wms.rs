//! WMS handlers: GetCapabilities and a GetMap that resolves to the closest
//! cached tile and redirects to the WMTS binding.

use axum::extract::{Extension, Query};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use ogc_protocol::{wms_exception, WmsCapabilitiesBuilder, WmsKvpParams};
use std::collections::HashMap;
use std::sync::Arc;
use tile_common::{BoundingBox, CrsId};

use crate::state::AppState;

use super::common::{base_url, xml_response};

const EARTH_RADIUS_M: f64 = 6378137.0;

/// GET /wms: GetCapabilities and GetMap.
pub async fn wms_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(raw): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let params = WmsKvpParams::from_query(&raw);
    let request = params
        .request
        .as_deref()
        .unwrap_or("GetCapabilities")
        .to_ascii_lowercase();

    match request.as_str() {
        "getcapabilities" => capabilities_response(&state, &params, &headers),
        "getmap" => get_map(&state, &params, &headers),
        other => xml_response(
            StatusCode::BAD_REQUEST,
            wms_exception(
                "OperationNotSupported",
                &format!("Unknown request: {}", other),
            ),
        ),
    }
}

fn capabilities_response(
    state: &Arc<AppState>,
    params: &WmsKvpParams,
    headers: &HeaderMap,
) -> Response {
    let inventory = state.inventory.get();
    let layers = inventory.wmts_layers(params.project.as_deref(), None);
    let builder = WmsCapabilitiesBuilder {
        service: state.inventory.service_metadata(),
        base_url: base_url(&state.settings, headers),
        layers,
    };
    xml_response(StatusCode::OK, builder.build())
}

fn get_map(state: &Arc<AppState>, params: &WmsKvpParams, headers: &HeaderMap) -> Response {
    if let Some(format) = params.format.as_deref() {
        if format != "image/png" {
            return xml_response(
                StatusCode::BAD_REQUEST,
                wms_exception("InvalidFormat", "Only image/png is produced"),
            );
        }
    }

    let Some(layers_param) = params.layers.as_deref() else {
        return xml_response(
            StatusCode::BAD_REQUEST,
            wms_exception("MissingParameterValue", "LAYERS is required"),
        );
    };
    let requested = layers_param.split(',').next().unwrap_or("").trim();

    let (Some(width), Some(height)) = (params.width, params.height) else {
        return xml_response(
            StatusCode::BAD_REQUEST,
            wms_exception("MissingParameterValue", "WIDTH and HEIGHT are required"),
        );
    };
    if width == 0 || height == 0 {
        return xml_response(
            StatusCode::BAD_REQUEST,
            wms_exception("InvalidParameterValue", "WIDTH and HEIGHT must be positive"),
        );
    }

    let Some(bbox_raw) = params.bbox.as_deref() else {
        return xml_response(
            StatusCode::BAD_REQUEST,
            wms_exception("MissingParameterValue", "BBOX is required"),
        );
    };
    let Ok(mut bbox) = BoundingBox::from_kvp_string(bbox_raw) else {
        return xml_response(
            StatusCode::BAD_REQUEST,
            wms_exception("InvalidParameterValue", "Malformed BBOX"),
        );
    };

    let inventory = state.inventory.get();
    let Some(layer) = inventory.find_kvp(requested) else {
        return xml_response(
            StatusCode::NOT_FOUND,
            wms_exception("LayerNotDefined", requested),
        );
    };

    let request_crs = params
        .crs
        .as_deref()
        .and_then(CrsId::normalize)
        .unwrap_or_else(|| layer.tile_crs.clone());

    // WMS 1.3.0 swaps axes for northing-first CRSes.
    let version_1_3 = params.version.as_deref().map_or(true, |v| v >= "1.3");
    if version_1_3 && request_crs.northing_first() {
        bbox = BoundingBox::new(bbox.min_y, bbox.min_x, bbox.max_y, bbox.max_x);
    }

    // Coordinate transformation is the renderer's job; the only conversion
    // done here is the closed-form geographic-to-Web-Mercator case.
    let bbox = if request_crs == layer.tile_crs {
        bbox
    } else if request_crs == CrsId::epsg_4326() && layer.tile_crs.is_web_mercator() {
        lonlat_to_mercator_bbox(&bbox)
    } else {
        return xml_response(
            StatusCode::BAD_REQUEST,
            wms_exception(
                "InvalidCRS",
                &format!(
                    "Cannot serve {} from tiles in {}",
                    request_crs, layer.tile_crs
                ),
            ),
        );
    };

    let Some(matrices) = inventory.matrices_for(&layer.set_id) else {
        return xml_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            wms_exception("NoApplicableCode", "Layer has no matrix set"),
        );
    };
    let target_resolution = (bbox.width() / width as f64).max(bbox.height() / height as f64);
    let Some(matrix) = matrices.iter().min_by(|a, b| {
        (a.resolution - target_resolution)
            .abs()
            .total_cmp(&(b.resolution - target_resolution).abs())
    }) else {
        return xml_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            wms_exception("NoApplicableCode", "Empty matrix set"),
        );
    };

    let (center_x, center_y) = bbox.center();
    let span_x = matrix.resolution * matrix.tile_width as f64;
    let span_y = matrix.resolution * matrix.tile_height as f64;
    let col = ((center_x - matrix.bbox_origin.0) / span_x).floor() as i64;
    let row = ((matrix.bbox_origin.1 - center_y) / span_y).floor() as i64;
    let col = col.clamp(0, matrix.matrix_width as i64 - 1);
    let row = row.clamp(0, matrix.matrix_height as i64 - 1);

    let location = format!(
        "{}/wmts/rest/{}/{}/default/{}/{}/{}/{}.png",
        base_url(&state.settings, headers),
        layer.project_key,
        layer.layer_key,
        layer.set_id,
        matrix.identifier,
        row,
        col
    );
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

/// Closed-form EPSG:4326 to EPSG:3857 for the GetMap convenience path.
fn lonlat_to_mercator_bbox(bbox: &BoundingBox) -> BoundingBox {
    fn project(lon: f64, lat: f64) -> (f64, f64) {
        let clamped_lat = lat.clamp(-85.06, 85.06);
        let x = lon.to_radians() * EARTH_RADIUS_M;
        let y = ((std::f64::consts::FRAC_PI_4 + clamped_lat.to_radians() / 2.0).tan())
            .ln()
            * EARTH_RADIUS_M;
        (x, y)
    }
    let (min_x, min_y) = project(bbox.min_x, bbox.min_y);
    let (max_x, max_y) = project(bbox.max_x, bbox.max_y);
    BoundingBox::new(min_x, min_y, max_x, max_y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lonlat_to_mercator() {
        let bbox = BoundingBox::new(-180.0, -85.06, 180.0, 85.06);
        let projected = lonlat_to_mercator_bbox(&bbox);
        assert!((projected.min_x + 20037508.342789244).abs() < 1.0);
        assert!((projected.max_x - 20037508.342789244).abs() < 1.0);
        // Web Mercator is square at the clamp latitude.
        assert!((projected.max_y - 20037508.0).abs() < 50000.0);
    }

    #[test]
    fn test_origin_maps_to_zero() {
        let bbox = BoundingBox::new(-0.001, -0.001, 0.001, 0.001);
        let projected = lonlat_to_mercator_bbox(&bbox);
        let (cx, cy) = projected.center();
        assert!(cx.abs() < 1.0);
        assert!(cy.abs() < 1.0);
    }
}
