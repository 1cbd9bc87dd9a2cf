//! Admin and project access guards.
//!
//! Authentication itself lives in an external provider; this module only
//! enforces the admin token when one is configured. Without `ADMIN_TOKEN`
//! the guard is open (development mode). Per-project access is the external
//! provider's concern and defaults to permissive here.

use axum::http::HeaderMap;
use tile_common::{TileError, TileResult};

use crate::settings::Settings;

/// Enforce the admin guard for admin-only endpoints.
pub fn require_admin(settings: &Settings, headers: &HeaderMap) -> TileResult<()> {
    let Some(expected) = &settings.admin_token else {
        return Ok(());
    };

    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let token = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .or(bearer);

    match token {
        Some(provided) if provided == expected => Ok(()),
        _ => Err(TileError::AuthRequired),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_open_without_token() {
        let settings = Settings::from_env();
        let open = Settings {
            admin_token: None,
            ..settings
        };
        assert!(require_admin(&open, &HeaderMap::new()).is_ok());
    }

    #[test]
    fn test_guarded_with_token() {
        let settings = Settings {
            admin_token: Some("s3cret".to_string()),
            ..Settings::from_env()
        };

        assert!(matches!(
            require_admin(&settings, &HeaderMap::new()),
            Err(TileError::AuthRequired)
        ));

        let mut headers = HeaderMap::new();
        headers.insert("x-admin-token", HeaderValue::from_static("s3cret"));
        assert!(require_admin(&settings, &headers).is_ok());

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer s3cret"));
        assert!(require_admin(&settings, &headers).is_ok());

        let mut headers = HeaderMap::new();
        headers.insert("x-admin-token", HeaderValue::from_static("wrong"));
        assert!(require_admin(&settings, &headers).is_err());
    }
}
