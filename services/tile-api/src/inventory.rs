//! Cache inventory: the normalized view of every published layer, built by
//! walking `cache/*/index.json`.
//!
//! The OGC endpoints never read index files directly; they resolve layers
//! and tile matrices through this module. Layers that could not serve a
//! single tile (no XYZ-in-WebMercator coverage and no custom matrix set)
//! are filtered out so capabilities never advertise dead layers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use storage::{read_json_with_backup, CacheLayout, TargetKind};
use tile_common::{
    tile::{web_mercator_scale_denominator, WEB_MERCATOR_EXTENT},
    BoundingBox, CrsId, MatrixEntry, TileMatrixSetPreset,
};

use ogc_protocol::{ServiceMetadata, WmtsLayerEntry, WmtsMatrix, WmtsMatrixSet};

use crate::index_store::CacheIndex;
use crate::settings::Settings;

/// Identifier of the synthesized global Web Mercator set.
pub const WEB_MERCATOR_SET_ID: &str = "EPSG_3857";

/// How long a built inventory is reused before rescanning the cache tree.
const INVENTORY_TTL: Duration = Duration::from_secs(5);

/// A resolvable tile matrix within a layer's bound set.
#[derive(Debug, Clone)]
pub struct ResolvedMatrix {
    pub identifier: String,
    /// Zoom level tiles are stored under on disk.
    pub source_level: u32,
    pub matrix_width: u32,
    pub matrix_height: u32,
    pub resolution: f64,
    pub bbox_origin: (f64, f64),
    pub tile_width: u32,
    pub tile_height: u32,
}

impl ResolvedMatrix {
    /// Bounding box of one tile of this matrix, `(x, y)` axis order.
    pub fn tile_bbox(&self, col: u32, row: u32) -> BoundingBox {
        let span_x = self.resolution * self.tile_width as f64;
        let span_y = self.resolution * self.tile_height as f64;
        let min_x = self.bbox_origin.0 + col as f64 * span_x;
        let max_y = self.bbox_origin.1 - row as f64 * span_y;
        BoundingBox::new(min_x, max_y - span_y, min_x + span_x, max_y)
    }
}

/// A published layer with everything needed to route tile requests.
#[derive(Debug, Clone)]
pub struct InventoryLayer {
    pub identifier: String,
    pub project: String,
    pub name: String,
    pub kind: String,
    pub project_key: String,
    pub layer_key: String,
    pub set_id: String,
    pub tile_crs: CrsId,
    pub zoom_min: u32,
    pub zoom_max: u32,
    pub wgs84_bbox: Option<BoundingBox>,
    pub native_bbox: Option<BoundingBox>,
    pub preset_id: Option<String>,
}

impl InventoryLayer {
    pub fn target_kind(&self) -> TargetKind {
        if self.kind == "theme" {
            TargetKind::Theme
        } else {
            TargetKind::Layer
        }
    }

    fn to_wmts_entry(&self) -> WmtsLayerEntry {
        WmtsLayerEntry {
            identifier: self.identifier.clone(),
            title: self.name.clone(),
            project_key: self.project_key.clone(),
            layer_key: self.layer_key.clone(),
            tile_matrix_set_id: self.set_id.clone(),
            native_crs: self.tile_crs.clone(),
            wgs84_bbox: self.wgs84_bbox,
            native_bbox: self.native_bbox,
            format: "image/png".to_string(),
        }
    }
}

/// The normalized inventory.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub layers: Vec<InventoryLayer>,
    /// Set id -> matrices, identifier order preserved.
    pub matrix_sets: HashMap<String, (CrsId, Vec<ResolvedMatrix>)>,
}

impl Inventory {
    /// Build from every readable project index under the cache root.
    pub fn build(layout: &CacheLayout, presets: &[TileMatrixSetPreset]) -> Self {
        let mut inventory = Inventory::default();
        let mut max_web_mercator_zoom = 0u32;

        let Ok(entries) = std::fs::read_dir(layout.root()) else {
            return inventory;
        };
        for dir_entry in entries.flatten() {
            let dir = dir_entry.path();
            if !dir.is_dir() {
                continue;
            }
            let Some(project) = dir.file_name().and_then(|n| n.to_str()).map(str::to_string)
            else {
                continue;
            };
            let index_path = dir.join("index.json");
            let Some(index) = read_json_with_backup::<CacheIndex>(&index_path) else {
                continue;
            };

            for entry in &index.layers {
                let Some(tile_crs) = entry
                    .tile_crs
                    .as_deref()
                    .and_then(CrsId::normalize)
                else {
                    continue;
                };

                let preset = entry.tile_matrix_preset.as_deref().and_then(|id| {
                    presets
                        .iter()
                        .find(|p| p.id == id && p.supports_crs(&tile_crs))
                });

                // Serveability filter: Web Mercator XYZ or a custom set.
                let set_id = if let Some(preset) = preset {
                    preset.id.clone()
                } else if tile_crs.is_web_mercator() {
                    WEB_MERCATOR_SET_ID.to_string()
                } else {
                    continue;
                };

                let zoom_min = entry
                    .published_zoom_min
                    .or(entry.zoom_min)
                    .or(entry.cached_zoom_min)
                    .unwrap_or(0);
                let zoom_max = entry
                    .published_zoom_max
                    .or(entry.zoom_max)
                    .or(entry.cached_zoom_max)
                    .unwrap_or(zoom_min)
                    .max(zoom_min);

                if set_id == WEB_MERCATOR_SET_ID {
                    max_web_mercator_zoom = max_web_mercator_zoom.max(zoom_max);
                } else if let Some(preset) = preset {
                    inventory
                        .matrix_sets
                        .entry(set_id.clone())
                        .or_insert_with(|| (tile_crs.clone(), normalize_preset(preset)));
                }

                let project_key = normalize_key(&project);
                let layer_key = normalize_key(&entry.name);
                inventory.layers.push(InventoryLayer {
                    identifier: format!("{}_{}", project_key, layer_key),
                    project: project.clone(),
                    name: entry.name.clone(),
                    kind: entry.kind.clone(),
                    project_key,
                    layer_key,
                    set_id,
                    tile_crs,
                    zoom_min,
                    zoom_max,
                    wgs84_bbox: entry
                        .extent_wgs84
                        .as_deref()
                        .and_then(BoundingBox::from_array),
                    native_bbox: entry.extent.as_deref().and_then(BoundingBox::from_array),
                    preset_id: entry.tile_matrix_preset.clone(),
                });
            }
        }

        inventory.layers.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        inventory.matrix_sets.insert(
            WEB_MERCATOR_SET_ID.to_string(),
            (
                CrsId::epsg_3857(),
                web_mercator_matrices(max_web_mercator_zoom),
            ),
        );
        inventory
    }

    /// REST routing: exact project/layer key match.
    pub fn find_rest(&self, project_key: &str, layer_key: &str) -> Option<&InventoryLayer> {
        self.layers
            .iter()
            .find(|l| l.project_key == project_key && l.layer_key == layer_key)
    }

    /// KVP routing: identifier, layer name, layer key, or identifier suffix.
    pub fn find_kvp(&self, requested: &str) -> Option<&InventoryLayer> {
        self.layers
            .iter()
            .find(|l| l.identifier == requested)
            .or_else(|| self.layers.iter().find(|l| l.name == requested))
            .or_else(|| self.layers.iter().find(|l| l.layer_key == requested))
            .or_else(|| {
                self.layers
                    .iter()
                    .find(|l| l.identifier.ends_with(&format!("_{}", requested)))
            })
    }

    pub fn matrices_for(&self, set_id: &str) -> Option<&Vec<ResolvedMatrix>> {
        self.matrix_sets.get(set_id).map(|(_, m)| m)
    }

    pub fn matrix(&self, set_id: &str, identifier: &str) -> Option<&ResolvedMatrix> {
        self.matrices_for(set_id)?
            .iter()
            .find(|m| m.identifier == identifier)
    }

    /// The WMTS layer records, capability-document shaped.
    pub fn wmts_layers(&self, project: Option<&str>, layer: Option<&str>) -> Vec<WmtsLayerEntry> {
        self.layers
            .iter()
            .filter(|l| project.map_or(true, |p| l.project == p || l.project_key == p))
            .filter(|l| layer.map_or(true, |n| l.name == n || l.layer_key == n))
            .map(InventoryLayer::to_wmts_entry)
            .collect()
    }

    /// The matrix sets referenced by the given layer records.
    pub fn wmts_matrix_sets(&self, layers: &[WmtsLayerEntry]) -> Vec<WmtsMatrixSet> {
        let mut sets: Vec<WmtsMatrixSet> = Vec::new();
        for layer in layers {
            if sets.iter().any(|s| s.identifier == layer.tile_matrix_set_id) {
                continue;
            }
            let Some((crs, matrices)) = self.matrix_sets.get(&layer.tile_matrix_set_id) else {
                continue;
            };
            sets.push(WmtsMatrixSet {
                identifier: layer.tile_matrix_set_id.clone(),
                crs: crs.clone(),
                matrices: matrices
                    .iter()
                    .map(|m| WmtsMatrix {
                        identifier: m.identifier.clone(),
                        scale_denominator: resolution_to_scale(m.resolution),
                        top_left: m.bbox_origin,
                        tile_width: m.tile_width,
                        tile_height: m.tile_height,
                        matrix_width: m.matrix_width,
                        matrix_height: m.matrix_height,
                    })
                    .collect(),
            });
        }
        sets.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        sets
    }
}

/// Scale denominator from a resolution at the OGC 0.28mm pixel.
fn resolution_to_scale(resolution: f64) -> f64 {
    resolution / 0.00028
}

/// Normalize a project or layer name into a routing key.
pub fn normalize_key(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn normalize_preset(preset: &TileMatrixSetPreset) -> Vec<ResolvedMatrix> {
    preset
        .matrices
        .iter()
        .map(|matrix: &MatrixEntry| {
            let (tile_width, tile_height) = preset.tile_size(matrix);
            ResolvedMatrix {
                identifier: matrix.identifier.clone(),
                source_level: matrix.source_level(),
                matrix_width: matrix.matrix_width,
                matrix_height: matrix.matrix_height,
                resolution: matrix.resolution,
                bbox_origin: preset.origin_xy(matrix),
                tile_width,
                tile_height,
            }
        })
        .collect()
}

fn web_mercator_matrices(max_zoom: u32) -> Vec<ResolvedMatrix> {
    (0..=max_zoom)
        .map(|z| {
            let n = 2u32.pow(z);
            ResolvedMatrix {
                identifier: z.to_string(),
                source_level: z,
                matrix_width: n,
                matrix_height: n,
                resolution: web_mercator_scale_denominator(z) * 0.00028,
                bbox_origin: (-WEB_MERCATOR_EXTENT, WEB_MERCATOR_EXTENT),
                tile_width: 256,
                tile_height: 256,
            }
        })
        .collect()
}

/// Short-lived inventory cache so tile storms do not rescan every index
/// file per request.
pub struct InventoryCache {
    layout: CacheLayout,
    presets: Arc<Vec<TileMatrixSetPreset>>,
    service: ServiceMetadata,
    cached: Mutex<Option<(Instant, Arc<Inventory>)>>,
}

impl InventoryCache {
    pub fn new(
        settings: &Settings,
        layout: CacheLayout,
        presets: Arc<Vec<TileMatrixSetPreset>>,
    ) -> Self {
        let service = read_json_with_backup::<ServiceMetadata>(&settings.service_metadata_path())
            .unwrap_or_default();
        Self {
            layout,
            presets,
            service,
            cached: Mutex::new(None),
        }
    }

    pub fn service_metadata(&self) -> ServiceMetadata {
        self.service.clone()
    }

    pub fn get(&self) -> Arc<Inventory> {
        {
            let cached = self.cached.lock().unwrap();
            if let Some((built_at, inventory)) = cached.as_ref() {
                if built_at.elapsed() < INVENTORY_TTL {
                    return inventory.clone();
                }
            }
        }
        let fresh = Arc::new(Inventory::build(&self.layout, &self.presets));
        *self.cached.lock().unwrap() = Some((Instant::now(), fresh.clone()));
        fresh
    }

    /// Drop the cached snapshot, forcing a rebuild on next access.
    pub fn invalidate(&self) {
        *self.cached.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index_store::{IndexEntry, IndexStore};
    use tempfile::tempdir;

    fn seed_index(dir: &std::path::Path) {
        let mut settings = Settings::from_env();
        settings.cache_dir = dir.to_path_buf();
        let store = IndexStore::new(CacheLayout::new(dir), Arc::new(settings));

        store
            .upsert_entry("orto", "layer", "parcels", |mut e: IndexEntry| {
                e.scheme = Some("xyz".to_string());
                e.tile_crs = Some("EPSG:3857".to_string());
                e.published_zoom_min = Some(0);
                e.published_zoom_max = Some(7);
                e.extent_wgs84 = Some(vec![11.0, 55.0, 24.0, 69.0]);
                e
            })
            .unwrap();
        // Unserveable: non-mercator CRS without a preset.
        store
            .upsert_entry("orto", "layer", "hidden", |mut e: IndexEntry| {
                e.tile_crs = Some("EPSG:3006".to_string());
                e
            })
            .unwrap();
        // No tile CRS at all.
        store
            .upsert_entry("orto", "layer", "broken", |e| e)
            .unwrap();
    }

    #[test]
    fn test_build_filters_unserveable() {
        let dir = tempdir().unwrap();
        seed_index(dir.path());
        let inventory = Inventory::build(&CacheLayout::new(dir.path()), &[]);
        assert_eq!(inventory.layers.len(), 1);
        assert_eq!(inventory.layers[0].identifier, "orto_parcels");
        assert_eq!(inventory.layers[0].set_id, WEB_MERCATOR_SET_ID);
    }

    #[test]
    fn test_web_mercator_set_spans_seen_zooms() {
        let dir = tempdir().unwrap();
        seed_index(dir.path());
        let inventory = Inventory::build(&CacheLayout::new(dir.path()), &[]);
        let matrices = inventory.matrices_for(WEB_MERCATOR_SET_ID).unwrap();
        assert_eq!(matrices.len(), 8);
        let top = &matrices[0];
        assert!((resolution_to_scale(top.resolution) - 559082264.0287178).abs() < 1e-3);
        assert_eq!(matrices[7].matrix_width, 128);
    }

    #[test]
    fn test_kvp_matching_precedence() {
        let dir = tempdir().unwrap();
        seed_index(dir.path());
        let inventory = Inventory::build(&CacheLayout::new(dir.path()), &[]);
        assert!(inventory.find_kvp("orto_parcels").is_some());
        assert!(inventory.find_kvp("parcels").is_some());
        assert!(inventory.find_kvp("nope").is_none());
    }

    #[test]
    fn test_preset_layer_uses_preset_set() {
        let dir = tempdir().unwrap();
        let mut settings = Settings::from_env();
        settings.cache_dir = dir.path().to_path_buf();
        let store = IndexStore::new(CacheLayout::new(dir.path()), Arc::new(settings));
        store
            .upsert_entry("plan", "layer", "detalj", |mut e: IndexEntry| {
                e.tile_crs = Some("EPSG:3006".to_string());
                e.tile_matrix_preset = Some("sweref99tm".to_string());
                e.published_zoom_min = Some(0);
                e.published_zoom_max = Some(1);
                e
            })
            .unwrap();

        let preset: TileMatrixSetPreset = serde_json::from_value(serde_json::json!({
            "id": "sweref99tm",
            "supported_crs": ["EPSG:3006"],
            "tile_width": 256,
            "tile_height": 256,
            "axis_order": "yx",
            "top_left_corner": [8500000.0, -1200000.0],
            "matrices": [
                {"identifier": "0", "z": 0, "source_level": 4, "resolution": 4096.0,
                 "scale_denominator": 14634739.433, "matrix_width": 4, "matrix_height": 4}
            ]
        }))
        .unwrap();

        let inventory = Inventory::build(&CacheLayout::new(dir.path()), &[preset]);
        let layer = inventory.find_rest("plan", "detalj").unwrap();
        assert_eq!(layer.set_id, "sweref99tm");
        let matrix = inventory.matrix("sweref99tm", "0").unwrap();
        assert_eq!(matrix.source_level, 4);
        assert_eq!(matrix.bbox_origin, (-1200000.0, 8500000.0));

        let tile = matrix.tile_bbox(0, 0);
        assert!((tile.max_y - 8500000.0).abs() < 1e-6);
    }
}
