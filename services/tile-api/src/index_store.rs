//! Per-project cache index: `cache/<id>/index.json`.
//!
//! The index is the single source the OGC endpoints read; every cached
//! layer/theme has exactly one entry keyed by `(kind, name)`. Entries
//! survive cache deletion (with their cached-zoom fields cleared) so the
//! admin surface can distinguish "uncached" from "unknown".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use storage::{read_json_with_backup, write_atomic_with_backup, CacheLayout, TargetKind};
use tile_common::{TileError, TileResult};
use tracing::warn;

use crate::settings::Settings;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct IndexEntry {
    pub name: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tile_crs: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crs: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cacheable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extent: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extent_wgs84: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zoom_min: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zoom_max: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_zoom_min: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_zoom_max: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_zoom_min: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_zoom_max: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_zoom_min: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_zoom_max: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tile_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xyz_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tile_matrix_preset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tile_matrix_set: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tile_profile_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tile_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_removed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_exists: Option<bool>,
    /// Filled on read for API consumers; never persisted as true state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_tiles: Option<bool>,
}

impl IndexEntry {
    pub fn new(kind: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            ..Default::default()
        }
    }

    pub fn target_kind(&self) -> TargetKind {
        if self.kind == "theme" {
            TargetKind::Theme
        } else {
            TargetKind::Layer
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CacheIndex {
    pub project: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    pub layers: Vec<IndexEntry>,
}

impl CacheIndex {
    pub fn empty(project: &str) -> Self {
        Self {
            project: project.to_string(),
            id: project.to_string(),
            created: Some(Utc::now()),
            updated: Some(Utc::now()),
            layers: Vec::new(),
        }
    }

    pub fn entry(&self, kind: &str, name: &str) -> Option<&IndexEntry> {
        self.layers
            .iter()
            .find(|e| e.kind == kind && e.name == name)
    }
}

/// Index service over the atomic JSON store.
pub struct IndexStore {
    layout: CacheLayout,
    settings: Arc<Settings>,
    /// Serializes read-modify-write cycles within this process.
    write_lock: std::sync::Mutex<()>,
}

impl IndexStore {
    pub fn new(layout: CacheLayout, settings: Arc<Settings>) -> Self {
        Self {
            layout,
            settings,
            write_lock: std::sync::Mutex::new(()),
        }
    }

    pub fn read(&self, project: &str) -> CacheIndex {
        let Some(path) = self.layout.index_path(project) else {
            return CacheIndex::empty(project);
        };
        read_json_with_backup::<CacheIndex>(&path)
            .unwrap_or_else(|| CacheIndex::empty(project))
    }

    pub fn write(&self, project: &str, mut index: CacheIndex) -> TileResult<()> {
        let path = self
            .layout
            .index_path(project)
            .ok_or_else(|| TileError::ProjectNotFound(project.to_string()))?;
        index.project = project.to_string();
        if index.id.is_empty() {
            index.id = project.to_string();
        }
        if index.created.is_none() {
            index.created = Some(Utc::now());
        }
        index.updated = Some(Utc::now());
        write_atomic_with_backup(&path, &index)
            .map_err(|e| TileError::WriteFailed(format!("{}: {}", path.display(), e)))
    }

    /// Load-modify-store one entry keyed by `(kind, name)`. Any prior match
    /// is removed, the updater runs on it (or a fresh entry), and the result
    /// is re-appended with a fresh `updated` stamp.
    pub fn upsert_entry(
        &self,
        project: &str,
        kind: &str,
        name: &str,
        updater: impl FnOnce(IndexEntry) -> IndexEntry,
    ) -> TileResult<IndexEntry> {
        let _guard = self.write_lock.lock().unwrap();
        let mut index = self.read(project);
        let existing = index
            .layers
            .iter()
            .position(|e| e.kind == kind && e.name == name)
            .map(|pos| index.layers.remove(pos))
            .unwrap_or_else(|| IndexEntry::new(kind, name));

        let mut entry = updater(existing);
        entry.kind = kind.to_string();
        entry.name = name.to_string();
        entry.updated = Some(Utc::now());
        index.layers.push(entry.clone());
        self.write(project, index)?;
        Ok(entry)
    }

    /// Cache deletion keeps the entry but clears its cached range so the
    /// layer reads as "uncached" rather than vanishing.
    pub fn clear_cache_fields(&self, project: &str, kind: &str, name: &str) {
        let exists = self.read(project).entry(kind, name).is_some();
        if !exists {
            return;
        }
        let result = self.upsert_entry(project, kind, name, |mut entry| {
            entry.cached_zoom_min = None;
            entry.cached_zoom_max = None;
            entry.path = None;
            entry.tile_count = None;
            entry.status = None;
            entry.partial = None;
            entry.progress = None;
            entry.cache_removed_at = Some(Utc::now());
            entry.cache_exists = Some(false);
            entry
        });
        if let Err(e) = result {
            warn!(project = %project, target = %name, error = %e, "Failed to clear index entry");
        }
    }

    /// Read the index with serving-oriented augmentation: `has_tiles` and a
    /// cached-zoom backfill derived from the tile tree for entries whose
    /// range fields are missing.
    pub fn read_augmented(&self, project: &str) -> CacheIndex {
        let mut index = self.read(project);
        for entry in &mut index.layers {
            let Some(dir) = self
                .layout
                .target_dir(project, entry.target_kind(), &entry.name)
            else {
                continue;
            };
            let range = scan_zoom_range(&dir);
            entry.has_tiles = Some(range.is_some());
            if entry.cached_zoom_min.is_none() || entry.cached_zoom_max.is_none() {
                if let Some((min, max)) = range {
                    entry.cached_zoom_min.get_or_insert(min);
                    entry.cached_zoom_max.get_or_insert(max);
                }
            }
        }
        index
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

/// Scan a tile tree for the lowest and highest zoom directory that holds at
/// least one file.
fn scan_zoom_range(dir: &Path) -> Option<(u32, u32)> {
    let entries = fs::read_dir(dir).ok()?;
    let mut min: Option<u32> = None;
    let mut max: Option<u32> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(z) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };
        if !dir_has_file(&path) {
            continue;
        }
        min = Some(min.map_or(z, |m| m.min(z)));
        max = Some(max.map_or(z, |m| m.max(z)));
    }
    Some((min?, max?))
}

fn dir_has_file(dir: &Path) -> bool {
    walkdir::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(3)
        .into_iter()
        .flatten()
        .any(|e| e.file_type().is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_store(dir: &Path) -> IndexStore {
        let mut settings = Settings::from_env();
        settings.cache_dir = dir.to_path_buf();
        IndexStore::new(CacheLayout::new(dir), Arc::new(settings))
    }

    #[test]
    fn test_upsert_replaces_by_kind_and_name() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());

        store
            .upsert_entry("orto", "layer", "parcels", |mut e| {
                e.zoom_min = Some(0);
                e.zoom_max = Some(3);
                e
            })
            .unwrap();
        store
            .upsert_entry("orto", "layer", "parcels", |mut e| {
                assert_eq!(e.zoom_min, Some(0));
                e.zoom_max = Some(5);
                e
            })
            .unwrap();
        // Same name, different kind: a distinct entry.
        store
            .upsert_entry("orto", "theme", "parcels", |e| e)
            .unwrap();

        let index = store.read("orto");
        assert_eq!(index.layers.len(), 2);
        let layer = index.entry("layer", "parcels").unwrap();
        assert_eq!(layer.zoom_max, Some(5));
        assert!(layer.updated.is_some());
    }

    #[test]
    fn test_cached_zoom_invariant_on_writes() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        store
            .upsert_entry("orto", "layer", "parcels", |mut e| {
                e.cached_zoom_min = Some(2);
                e.cached_zoom_max = Some(7);
                e
            })
            .unwrap();
        let entry = store.read("orto").entry("layer", "parcels").cloned().unwrap();
        assert!(entry.cached_zoom_min.unwrap() <= entry.cached_zoom_max.unwrap());
    }

    #[test]
    fn test_clear_cache_fields_keeps_entry() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        store
            .upsert_entry("orto", "layer", "parcels", |mut e| {
                e.cached_zoom_min = Some(0);
                e.cached_zoom_max = Some(3);
                e.path = Some("orto/parcels".to_string());
                e
            })
            .unwrap();

        store.clear_cache_fields("orto", "layer", "parcels");

        let index = store.read("orto");
        let entry = index.entry("layer", "parcels").unwrap();
        assert!(entry.cached_zoom_min.is_none());
        assert!(entry.cached_zoom_max.is_none());
        assert!(entry.path.is_none());
        assert_eq!(entry.cache_exists, Some(false));
        assert!(entry.cache_removed_at.is_some());
    }

    #[test]
    fn test_clear_on_missing_entry_is_noop() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        store.clear_cache_fields("orto", "layer", "ghost");
        assert!(store.read("orto").layers.is_empty());
    }

    #[test]
    fn test_augmented_backfills_zoom_from_tree() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        store
            .upsert_entry("orto", "layer", "parcels", |e| e)
            .unwrap();

        let tiles = dir.path().join("orto/parcels");
        for z in [2u32, 4u32] {
            let zd = tiles.join(z.to_string()).join("0");
            fs::create_dir_all(&zd).unwrap();
            fs::write(zd.join("0.png"), b"x").unwrap();
        }
        // Empty zoom dir must not count.
        fs::create_dir_all(tiles.join("9")).unwrap();

        let index = store.read_augmented("orto");
        let entry = index.entry("layer", "parcels").unwrap();
        assert_eq!(entry.has_tiles, Some(true));
        assert_eq!(entry.cached_zoom_min, Some(2));
        assert_eq!(entry.cached_zoom_max, Some(4));
    }
}
