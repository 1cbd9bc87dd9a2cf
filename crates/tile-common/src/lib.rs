//! Common types and utilities shared across the tile cache server.

pub mod bbox;
pub mod crs;
pub mod error;
pub mod matrix;
pub mod project;
pub mod tile;

pub use bbox::BoundingBox;
pub use crs::CrsId;
pub use error::{TileError, TileResult};
pub use matrix::{MatrixEntry, TileMatrixSetPreset};
pub use project::{sanitize_project_id, sanitize_storage_name};
pub use tile::{web_mercator_matrix_set, TileCoord, WEB_MERCATOR_EXTENT, WEB_MERCATOR_TOP_SCALE};
