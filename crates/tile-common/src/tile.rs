//! Tile coordinates and Web Mercator tile matrix math.

use crate::BoundingBox;
use serde::{Deserialize, Serialize};

/// Half the extent of the Web Mercator plane in meters.
pub const WEB_MERCATOR_EXTENT: f64 = 20037508.342789244;

/// Canonical scale denominator at zoom 0 for 256px Web Mercator tiles
/// (0.28mm/px per the OGC WMTS spec).
pub const WEB_MERCATOR_TOP_SCALE: f64 = 559082264.0287178;

/// A tile coordinate (z/x/y), top-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    /// Zoom level (TileMatrix identifier)
    pub z: u32,
    /// Column (x)
    pub x: u32,
    /// Row (y)
    pub y: u32,
}

impl TileCoord {
    pub fn new(z: u32, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// The `z/x/y` fragment used in cache paths and dedup keys.
    pub fn path_key(&self) -> String {
        format!("{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Resolution (meters per pixel) of a Web Mercator zoom level for 256px tiles.
pub fn web_mercator_resolution(z: u32) -> f64 {
    (WEB_MERCATOR_EXTENT * 2.0) / (256.0 * 2f64.powi(z as i32))
}

/// Canonical scale denominator for a Web Mercator zoom level.
pub fn web_mercator_scale_denominator(z: u32) -> f64 {
    WEB_MERCATOR_TOP_SCALE / 2f64.powi(z as i32)
}

/// Bounding box of a Web Mercator tile in EPSG:3857 meters.
pub fn web_mercator_tile_bbox(coord: &TileCoord) -> BoundingBox {
    let tile_span = (WEB_MERCATOR_EXTENT * 2.0) / 2f64.powi(coord.z as i32);
    let min_x = -WEB_MERCATOR_EXTENT + coord.x as f64 * tile_span;
    let max_y = WEB_MERCATOR_EXTENT - coord.y as f64 * tile_span;
    BoundingBox::new(min_x, max_y - tile_span, min_x + tile_span, max_y)
}

/// TMS (bottom-left origin) to XYZ (top-left origin) row flip.
pub fn tms_to_xyz(z: u32, x: u32, y: u32) -> TileCoord {
    let n = 2u32.pow(z);
    TileCoord { z, x, y: n - 1 - y }
}

/// A single tile matrix (zoom level) of the synthesized Web Mercator set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebMercatorMatrix {
    pub identifier: String,
    pub z: u32,
    pub scale_denominator: f64,
    pub matrix_width: u32,
    pub matrix_height: u32,
}

/// The global Web Mercator matrix set covering zooms `0..=max_zoom`.
///
/// Used for XYZ-cached layers that have no explicit preset binding.
pub fn web_mercator_matrix_set(max_zoom: u32) -> Vec<WebMercatorMatrix> {
    (0..=max_zoom)
        .map(|z| {
            let n = 2u32.pow(z);
            WebMercatorMatrix {
                identifier: z.to_string(),
                z,
                scale_denominator: web_mercator_scale_denominator(z),
                matrix_width: n,
                matrix_height: n,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_denominators() {
        assert!((web_mercator_scale_denominator(0) - 559082264.0287178).abs() < 1e-4);
        assert!((web_mercator_scale_denominator(1) - 279541132.0143589).abs() < 1e-4);
    }

    #[test]
    fn test_zoom0_bbox_covers_world() {
        let bbox = web_mercator_tile_bbox(&TileCoord::new(0, 0, 0));
        assert!((bbox.min_x + WEB_MERCATOR_EXTENT).abs() < 1e-6);
        assert!((bbox.max_x - WEB_MERCATOR_EXTENT).abs() < 1e-6);
        assert!((bbox.min_y + WEB_MERCATOR_EXTENT).abs() < 1e-6);
        assert!((bbox.max_y - WEB_MERCATOR_EXTENT).abs() < 1e-6);
    }

    #[test]
    fn test_tile_bbox_adjacency() {
        let a = web_mercator_tile_bbox(&TileCoord::new(3, 2, 1));
        let b = web_mercator_tile_bbox(&TileCoord::new(3, 3, 1));
        assert!((a.max_x - b.min_x).abs() < 1e-6);
        // Row 2 sits directly below row 1.
        let c = web_mercator_tile_bbox(&TileCoord::new(3, 2, 2));
        assert!((a.min_y - c.max_y).abs() < 1e-6);
    }

    #[test]
    fn test_tms_flip() {
        assert_eq!(tms_to_xyz(3, 4, 2), TileCoord::new(3, 4, 5));
        assert_eq!(tms_to_xyz(0, 0, 0), TileCoord::new(0, 0, 0));
    }

    #[test]
    fn test_matrix_set_dimensions() {
        let set = web_mercator_matrix_set(4);
        assert_eq!(set.len(), 5);
        assert_eq!(set[4].matrix_width, 16);
        assert_eq!(set[4].identifier, "4");
    }

    #[test]
    fn test_resolution_halves_per_zoom() {
        let r0 = web_mercator_resolution(0);
        let r1 = web_mercator_resolution(1);
        assert!((r0 / r1 - 2.0).abs() < 1e-9);
    }
}
