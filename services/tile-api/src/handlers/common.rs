//! Shared handler utilities: error bodies, base-URL resolution, tile file
//! responses.

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::path::Path;
use tile_common::TileError;

use crate::settings::Settings;

/// Wrapper turning [`TileError`] into the standard `{error, details?}` JSON
/// response, enriching conflict payloads with their ids.
pub struct ApiError(pub TileError);

impl From<TileError> for ApiError {
    fn from(err: TileError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status =
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let mut body = json!({ "error": err.code() });
        let obj = body.as_object_mut().unwrap();
        match &err {
            TileError::JobAlreadyRunning { id, .. } => {
                obj.insert("id".to_string(), json!(id));
            }
            TileError::BatchRunning { id, .. } => {
                obj.insert("id".to_string(), json!(id));
            }
            TileError::AbortFailed { pids, .. } => {
                obj.insert("pids".to_string(), json!(pids));
            }
            _ => {}
        }
        obj.insert("details".to_string(), json!(err.to_string()));

        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// External base URL for capability documents: the configured value when
/// set, otherwise reconstructed from the request's Host header.
pub fn base_url(settings: &Settings, headers: &HeaderMap) -> String {
    if let Some(configured) = &settings.public_base_url {
        return configured.trim_end_matches('/').to_string();
    }
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    format!("{}://{}", proto, host)
}

/// Serve a tile file with the given Cache-Control value.
pub fn tile_response(path: &Path, cache_control: &str) -> Response {
    match std::fs::read(path) {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "image/png".to_string()),
                (header::CACHE_CONTROL, cache_control.to_string()),
            ],
            bytes,
        )
            .into_response(),
        Err(_) => ApiError(TileError::TileNotFound).into_response(),
    }
}

/// An XML document response.
pub fn xml_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/xml; charset=utf-8")],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_prefers_configured() {
        let settings = Settings {
            public_base_url: Some("https://maps.example.org/".to_string()),
            ..Settings::from_env()
        };
        assert_eq!(
            base_url(&settings, &HeaderMap::new()),
            "https://maps.example.org"
        );
    }

    #[test]
    fn test_base_url_from_host_header() {
        let settings = Settings {
            public_base_url: None,
            ..Settings::from_env()
        };
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "tiles.local:8080".parse().unwrap());
        assert_eq!(base_url(&settings, &headers), "http://tiles.local:8080");
    }
}
