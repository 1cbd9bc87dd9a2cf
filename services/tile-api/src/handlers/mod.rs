//! HTTP request handlers.
//!
//! Organized by surface:
//! - `projects`: project listing/deletion, config GET/PATCH, batch runs
//! - `cache`: index GET/PATCH, cache deletion
//! - `jobs`: generate-cache admission, status, abort, orphan admin
//! - `ondemand`: viewer-session and pool control
//! - `wmts`: GetCapabilities, KVP/REST GetTile, legacy tile routes
//! - `wms`: GetCapabilities, GetMap redirect
//! - `common`: error bodies, base-URL and tile-response helpers

pub mod cache;
pub mod common;
pub mod jobs;
pub mod ondemand;
pub mod projects;
pub mod wms;
pub mod wmts;

pub use common::{ApiError, ApiResult};
