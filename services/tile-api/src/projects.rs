//! Project resolution, listing, bootstrap, and deletion.
//!
//! A project is a source file in the projects directory plus a cache
//! directory; the id is the sanitized file stem.

use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use storage::{purge_dir, CacheLayout, ProjectLog};
use tile_common::{sanitize_project_id, TileError, TileResult};
use tracing::{info, warn};

use crate::config_store::ConfigStore;
use crate::index_store::{CacheIndex, IndexStore};
use crate::jobs::JobManager;
use crate::schedule::Scheduler;
use crate::settings::Settings;

/// Source-file extensions recognized as projects.
const PROJECT_EXTENSIONS: [&str; 2] = ["qgs", "qgz"];

#[derive(Debug, Clone, Serialize)]
pub struct ProjectInfo {
    pub id: String,
    pub name: String,
    pub file: String,
}

/// Sanitize an externally supplied project id.
pub fn resolve_project_id(raw: &str) -> TileResult<String> {
    if raw.trim().is_empty() {
        return Err(TileError::ProjectIdRequired);
    }
    sanitize_project_id(raw).ok_or_else(|| TileError::ProjectNotFound(raw.to_string()))
}

/// Find the project source file whose sanitized stem matches the id.
pub fn resolve_project_file(settings: &Settings, id: &str) -> Option<PathBuf> {
    let entries = fs::read_dir(&settings.projects_dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let ext = path.extension().and_then(|e| e.to_str())?.to_lowercase();
        if !PROJECT_EXTENSIONS.contains(&ext.as_str()) {
            continue;
        }
        let stem = path.file_stem().and_then(|s| s.to_str())?;
        if sanitize_project_id(stem).as_deref() == Some(id) {
            return Some(path);
        }
    }
    None
}

/// A project exists when it has a source file or an existing cache tree.
pub fn project_exists(settings: &Settings, layout: &CacheLayout, id: &str) -> bool {
    if resolve_project_file(settings, id).is_some() {
        return true;
    }
    layout.project_dir(id).is_some_and(|dir| dir.exists())
}

/// List all projects visible in the projects directory.
pub fn list_projects(settings: &Settings) -> Vec<ProjectInfo> {
    let mut projects = Vec::new();
    let Ok(entries) = fs::read_dir(&settings.projects_dir) else {
        return projects;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if !PROJECT_EXTENSIONS.contains(&ext.to_lowercase().as_str()) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(id) = sanitize_project_id(stem) else {
            continue;
        };
        projects.push(ProjectInfo {
            id,
            name: stem.to_string(),
            file: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        });
    }
    projects.sort_by(|a, b| a.id.cmp(&b.id));
    projects
}

/// First-run metadata scan: seed a config and an empty index for any
/// project file without one. Skipped under `DISABLE_PROJECT_BOOTSTRAP`.
pub fn bootstrap_projects(
    settings: &Arc<Settings>,
    layout: &CacheLayout,
    config: &Arc<ConfigStore>,
    index: &Arc<IndexStore>,
) {
    if settings.disable_project_bootstrap {
        return;
    }
    for project in list_projects(settings) {
        let Some(config_path) = layout.project_config_path(&project.id) else {
            continue;
        };
        if config_path.exists() {
            continue;
        }
        info!(project = %project.id, "Bootstrapping new project");

        let mut cfg = crate::config_store::ProjectConfig::defaults_for(&project.id);
        cfg.cache_preferences.mode = settings.bootstrap_scheme.clone();
        cfg.cache_preferences.tile_crs = Some(settings.bootstrap_tile_crs.clone());
        cfg.zoom.min = Some(settings.bootstrap_zoom_min);
        cfg.zoom.max = Some(settings.bootstrap_zoom_max);
        if let Err(e) = config.write(&project.id, cfg, true) {
            warn!(project = %project.id, error = %e, "Bootstrap config write failed");
            continue;
        }
        if let Err(e) = index.write(&project.id, CacheIndex::empty(&project.id)) {
            warn!(project = %project.id, error = %e, "Bootstrap index write failed");
        }
    }
}

/// Delete a project: abort its jobs, wait for them to clear, then remove
/// the cache tree, the source file, the log, and in-memory state.
pub async fn delete_project(
    id: &str,
    settings: &Arc<Settings>,
    layout: &CacheLayout,
    jobs: &JobManager,
    scheduler: &Scheduler,
    config: &Arc<ConfigStore>,
    log: &Arc<ProjectLog>,
) -> TileResult<()> {
    let id = resolve_project_id(id)?;
    if !project_exists(settings, layout, &id) {
        return Err(TileError::ProjectNotFound(id));
    }

    // Jobs must be confirmed gone before the tile tree goes away.
    jobs.abort_jobs_for_project(&id).await?;
    scheduler.forget_project(&id);
    config.evict(&id);

    if let Some(dir) = layout.project_dir(&id) {
        purge_dir(&dir)
            .map_err(|e| TileError::CacheDeleteFailed(format!("{}: {}", dir.display(), e)))?;
    }
    if let Some(file) = resolve_project_file(settings, &id) {
        if let Err(e) = fs::remove_file(&file) {
            warn!(project = %id, error = %e, "Failed to remove project source file");
        }
    }
    log.remove(&id);
    info!(project = %id, "Project deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_resolve_project_id() {
        assert_eq!(resolve_project_id("Örto").unwrap(), "orto");
        assert!(matches!(
            resolve_project_id(""),
            Err(TileError::ProjectIdRequired)
        ));
        assert!(matches!(
            resolve_project_id("!!!"),
            Err(TileError::ProjectNotFound(_))
        ));
    }

    #[test]
    fn test_list_and_resolve_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("Orto Photos.qgs"), b"x").unwrap();
        fs::write(dir.path().join("roads.qgz"), b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let mut settings = Settings::from_env();
        settings.projects_dir = dir.path().to_path_buf();

        let listed = list_projects(&settings);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "ortophotos");
        assert_eq!(listed[1].id, "roads");

        let file = resolve_project_file(&settings, "ortophotos").unwrap();
        assert!(file.ends_with("Orto Photos.qgs"));
        assert!(resolve_project_file(&settings, "absent").is_none());
    }

    #[test]
    fn test_project_exists_via_cache_dir() {
        let projects = tempdir().unwrap();
        let cache = tempdir().unwrap();
        let mut settings = Settings::from_env();
        settings.projects_dir = projects.path().to_path_buf();
        let layout = CacheLayout::new(cache.path());

        assert!(!project_exists(&settings, &layout, "orto"));
        fs::create_dir_all(cache.path().join("orto")).unwrap();
        assert!(project_exists(&settings, &layout, "orto"));
    }
}
