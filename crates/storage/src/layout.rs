//! Tile tree layout and safe cache deletion.
//!
//! Layer tiles live at `cache/<project>/<storage>/<z>/<x>/<y>.<ext>`, theme
//! tiles under `cache/<project>/_themes/<storage>/...`. Deletion renames the
//! directory aside before removing it recursively, so a renderer shutting
//! down with open handles cannot leave a half-deleted live directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tile_common::{sanitize_project_id, sanitize_storage_name};
use tracing::{debug, warn};

const DELETE_ATTEMPTS: u32 = 6;
const DELETE_BACKOFF_BASE_MS: u64 = 50;

/// Subdirectory holding theme tile trees inside a project cache.
pub const THEMES_DIR: &str = "_themes";

/// Target kind within a project cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Layer,
    Theme,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Layer => "layer",
            TargetKind::Theme => "theme",
        }
    }
}

/// Resolves filesystem locations inside the cache root.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `cache/<project>/`
    pub fn project_dir(&self, project: &str) -> Option<PathBuf> {
        let id = sanitize_project_id(project)?;
        Some(self.root.join(id))
    }

    /// `cache/<project>/project-config.json`
    pub fn project_config_path(&self, project: &str) -> Option<PathBuf> {
        Some(self.project_dir(project)?.join("project-config.json"))
    }

    /// `cache/<project>/index.json`
    pub fn index_path(&self, project: &str) -> Option<PathBuf> {
        Some(self.project_dir(project)?.join("index.json"))
    }

    /// Tile tree root for a layer or theme.
    pub fn target_dir(&self, project: &str, kind: TargetKind, name: &str) -> Option<PathBuf> {
        let base = self.project_dir(project)?;
        let storage = sanitize_storage_name(name);
        Some(match kind {
            TargetKind::Layer => base.join(storage),
            TargetKind::Theme => base.join(THEMES_DIR).join(storage),
        })
    }

    /// Full path of one tile.
    pub fn tile_path(
        &self,
        project: &str,
        kind: TargetKind,
        name: &str,
        z: u32,
        x: u32,
        y: u32,
        ext: &str,
    ) -> Option<PathBuf> {
        Some(
            self.target_dir(project, kind, name)?
                .join(z.to_string())
                .join(x.to_string())
                .join(format!("{}.{}", y, ext)),
        )
    }
}

// ENOTEMPTY / EBUSY / ETXTBSY on Unix; sharing-violation and
// directory-not-empty on Windows.
const CONTENTION_CODES: [i32; 5] = [16, 26, 39, 32, 145];

fn is_contention(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::PermissionDenied)
        || matches!(e.raw_os_error(), Some(code) if CONTENTION_CODES.contains(&code))
}

fn remove_dir_with_retries(path: &Path) -> io::Result<()> {
    let mut last_err = None;
    for attempt in 0..DELETE_ATTEMPTS {
        match fs::remove_dir_all(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) if is_contention(&e) && attempt + 1 < DELETE_ATTEMPTS => {
                let backoff = DELETE_BACKOFF_BASE_MS * 2u64.pow(attempt);
                debug!(
                    path = %path.display(),
                    attempt = attempt + 1,
                    backoff_ms = backoff,
                    "Directory busy, retrying removal"
                );
                sleep(Duration::from_millis(backoff));
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::other("directory removal retries exhausted")))
}

/// Delete a cache directory using rename-then-remove.
///
/// The directory is first renamed to `<name>.__purge_<ts>_<rand>` so the
/// live path frees up immediately, then removed with bounded retries. When
/// the rename itself is refused, removal happens in place with the same
/// retry policy.
pub fn purge_dir(path: &Path) -> io::Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let nonce = millis as u32 ^ std::process::id();
    let mut tomb = path.as_os_str().to_owned();
    tomb.push(format!(".__purge_{}_{:x}", millis, nonce));
    let tomb = PathBuf::from(tomb);

    match fs::rename(path, &tomb) {
        Ok(()) => remove_dir_with_retries(&tomb),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Purge rename failed, deleting in place");
            remove_dir_with_retries(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_tile_paths() {
        let layout = CacheLayout::new("/srv/cache");
        assert_eq!(
            layout
                .tile_path("orto", TargetKind::Layer, "parcels", 3, 2, 1, "png")
                .unwrap(),
            PathBuf::from("/srv/cache/orto/parcels/3/2/1.png")
        );
        assert_eq!(
            layout
                .tile_path("orto", TargetKind::Theme, "base map", 0, 0, 0, "png")
                .unwrap(),
            PathBuf::from("/srv/cache/orto/_themes/base_map/0/0/0.png")
        );
    }

    #[test]
    fn test_project_id_is_sanitized() {
        let layout = CacheLayout::new("/srv/cache");
        assert_eq!(
            layout.project_dir("Örto").unwrap(),
            PathBuf::from("/srv/cache/orto")
        );
        assert!(layout.project_dir("///").is_none());
    }

    #[test]
    fn test_purge_removes_tree() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("layer");
        fs::create_dir_all(target.join("3/2")).unwrap();
        fs::write(target.join("3/2/1.png"), b"x").unwrap();

        purge_dir(&target).unwrap();
        assert!(!target.exists());
        // Tombstone is gone too.
        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_purge_missing_is_ok() {
        let dir = tempdir().unwrap();
        purge_dir(&dir.path().join("absent")).unwrap();
    }
}
