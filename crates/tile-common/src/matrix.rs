//! Tile-matrix-set presets loaded from disk.
//!
//! Presets describe non-Web-Mercator pyramids (national grids, custom
//! resolutions). They are static JSON files under `config/tile-grids/` and
//! bind cached layers to a concrete matrix geometry.

use crate::{BoundingBox, CrsId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Axis order of the preset's native CRS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AxisOrder {
    #[default]
    Xy,
    Yx,
}

/// One matrix (zoom level) of a preset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixEntry {
    pub identifier: String,

    /// Published zoom index within the set.
    pub z: u32,

    /// Renderer-side zoom level backing this matrix. Defaults to `z`.
    #[serde(default)]
    pub source_level: Option<u32>,

    /// Map units per pixel.
    pub resolution: f64,

    pub scale_denominator: f64,
    pub matrix_width: u32,
    pub matrix_height: u32,

    /// Per-matrix tile size override.
    #[serde(default, rename = "tileWidth")]
    pub tile_width: Option<u32>,
    #[serde(default, rename = "tileHeight")]
    pub tile_height: Option<u32>,

    /// Per-matrix origin override, in the set's declared axis order.
    #[serde(default, rename = "topLeftCorner")]
    pub top_left_corner: Option<[f64; 2]>,
}

impl MatrixEntry {
    /// The renderer zoom level tiles of this matrix are stored under.
    pub fn source_level(&self) -> u32 {
        self.source_level.unwrap_or(self.z)
    }
}

/// A tile-matrix-set preset as stored in `config/tile-grids/<id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileMatrixSetPreset {
    pub id: String,

    /// CRS identifiers this preset is valid for.
    pub supported_crs: Vec<CrsId>,

    pub tile_width: u32,
    pub tile_height: u32,

    #[serde(default)]
    pub axis_order: AxisOrder,

    /// Origin of the pyramid, in the declared axis order.
    pub top_left_corner: [f64; 2],

    pub matrices: Vec<MatrixEntry>,
}

impl TileMatrixSetPreset {
    /// Load a single preset file.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Load every `*.json` preset in a directory. Unparseable files are skipped.
    pub fn load_dir(dir: &Path) -> Vec<Self> {
        let mut presets = Vec::new();
        let Ok(entries) = fs::read_dir(dir) else {
            return presets;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                if let Ok(preset) = Self::load(&path) {
                    presets.push(preset);
                }
            }
        }
        presets.sort_by(|a, b| a.id.cmp(&b.id));
        presets
    }

    /// Whether this preset can serve the given tile CRS.
    pub fn supports_crs(&self, crs: &CrsId) -> bool {
        self.supported_crs.iter().any(|c| c == crs)
    }

    /// Find a matrix by its identifier.
    pub fn matrix_for_identifier(&self, identifier: &str) -> Option<&MatrixEntry> {
        self.matrices.iter().find(|m| m.identifier == identifier)
    }

    /// Find a matrix by published zoom index.
    pub fn matrix_for_zoom(&self, z: u32) -> Option<&MatrixEntry> {
        self.matrices.iter().find(|m| m.z == z)
    }

    /// The matrix whose resolution is closest to the requested one.
    pub fn matrix_for_resolution(&self, resolution: f64) -> Option<&MatrixEntry> {
        self.matrices.iter().min_by(|a, b| {
            (a.resolution - resolution)
                .abs()
                .total_cmp(&(b.resolution - resolution).abs())
        })
    }

    /// Origin of a matrix in `(x, y)` order regardless of declared axis order.
    pub fn origin_xy(&self, matrix: &MatrixEntry) -> (f64, f64) {
        let corner = matrix.top_left_corner.unwrap_or(self.top_left_corner);
        match self.axis_order {
            AxisOrder::Xy => (corner[0], corner[1]),
            AxisOrder::Yx => (corner[1], corner[0]),
        }
    }

    /// Effective tile pixel size of a matrix.
    pub fn tile_size(&self, matrix: &MatrixEntry) -> (u32, u32) {
        (
            matrix.tile_width.unwrap_or(self.tile_width),
            matrix.tile_height.unwrap_or(self.tile_height),
        )
    }

    /// Bounding box of a tile within a matrix, in the preset's CRS.
    pub fn tile_bbox(&self, matrix: &MatrixEntry, col: u32, row: u32) -> BoundingBox {
        let (origin_x, origin_y) = self.origin_xy(matrix);
        let (tile_w, tile_h) = self.tile_size(matrix);
        let span_x = matrix.resolution * tile_w as f64;
        let span_y = matrix.resolution * tile_h as f64;

        let min_x = origin_x + col as f64 * span_x;
        let max_y = origin_y - row as f64 * span_y;
        BoundingBox::new(min_x, max_y - span_y, min_x + span_x, max_y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sweref_preset() -> TileMatrixSetPreset {
        serde_json::from_value(serde_json::json!({
            "id": "sweref99tm",
            "supported_crs": ["EPSG:3006"],
            "tile_width": 256,
            "tile_height": 256,
            "axis_order": "yx",
            "top_left_corner": [8500000.0, -1200000.0],
            "matrices": [
                {
                    "identifier": "0",
                    "z": 0,
                    "resolution": 4096.0,
                    "scale_denominator": 14634739.433,
                    "matrix_width": 4,
                    "matrix_height": 4
                },
                {
                    "identifier": "1",
                    "z": 1,
                    "source_level": 5,
                    "resolution": 2048.0,
                    "scale_denominator": 7317369.716,
                    "matrix_width": 8,
                    "matrix_height": 8
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_axis_order_origin() {
        let preset = sweref_preset();
        let m = preset.matrix_for_zoom(0).unwrap();
        // yx preset: stored [northing, easting], origin_xy flips to (x, y).
        assert_eq!(preset.origin_xy(m), (-1200000.0, 8500000.0));
    }

    #[test]
    fn test_tile_bbox_top_left() {
        let preset = sweref_preset();
        let m = preset.matrix_for_zoom(0).unwrap();
        let bbox = preset.tile_bbox(m, 0, 0);
        let span = 4096.0 * 256.0;
        assert!((bbox.min_x + 1200000.0).abs() < 1e-6);
        assert!((bbox.max_y - 8500000.0).abs() < 1e-6);
        assert!((bbox.width() - span).abs() < 1e-6);
    }

    #[test]
    fn test_source_level_default() {
        let preset = sweref_preset();
        assert_eq!(preset.matrix_for_zoom(0).unwrap().source_level(), 0);
        assert_eq!(preset.matrix_for_zoom(1).unwrap().source_level(), 5);
    }

    #[test]
    fn test_matrix_for_resolution() {
        let preset = sweref_preset();
        assert_eq!(
            preset.matrix_for_resolution(2000.0).unwrap().identifier,
            "1"
        );
        assert_eq!(
            preset.matrix_for_resolution(100000.0).unwrap().identifier,
            "0"
        );
    }

    #[test]
    fn test_supports_crs() {
        let preset = sweref_preset();
        assert!(preset.supports_crs(&CrsId::normalize("EPSG:3006").unwrap()));
        assert!(!preset.supports_crs(&CrsId::epsg_3857()));
    }
}
