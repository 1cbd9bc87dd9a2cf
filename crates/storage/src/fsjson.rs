//! Atomic JSON documents with backup fallback.
//!
//! Every mutable JSON file on disk (project configs, cache indexes) goes
//! through these two functions. The write path guarantees that a concurrent
//! reader sees either the previous content (via `.bak`) or the new content,
//! never a torn file.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

fn bak_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".bak");
    PathBuf::from(os)
}

fn tmp_path(path: &Path) -> PathBuf {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let mut os = path.as_os_str().to_owned();
    os.push(format!(".tmp-{}-{}", std::process::id(), millis));
    PathBuf::from(os)
}

/// Read and parse a JSON document, falling back to its `.bak` sibling when
/// the primary file is missing or unparseable. Returns `None` when neither
/// yields a valid document.
pub fn read_json_with_backup<T: DeserializeOwned>(path: &Path) -> Option<T> {
    match fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(value) => return Some(value),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unparseable JSON file, trying backup");
            }
        },
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            warn!(path = %path.display(), error = %e, "Failed to read JSON file, trying backup");
        }
        Err(_) => {}
    }

    let bak = bak_path(path);
    let raw = fs::read_to_string(&bak).ok()?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %bak.display(), error = %e, "Backup JSON also unparseable");
            None
        }
    }
}

/// Serialize `value` and atomically replace `path`, keeping the previous
/// content as `path.bak`.
///
/// Sequence: write to a unique temp file, drop any stale `.bak`, rename the
/// current file to `.bak` (copying instead when the rename is refused by the
/// OS, e.g. a lock on Windows), then rename the temp file into place.
/// Parent directories are created on demand.
pub fn write_atomic_with_backup<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = tmp_path(path);
    let body = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    fs::write(&tmp, &body)?;

    let bak = bak_path(path);
    if path.exists() {
        let _ = fs::remove_file(&bak);
        if let Err(e) = fs::rename(path, &bak) {
            warn!(path = %path.display(), error = %e, "Backup rename failed, copying instead");
            fs::copy(path, &bak)?;
        }
    }

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tempfile::tempdir;

    #[test]
    fn test_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.json");

        write_atomic_with_backup(&path, &json!({"a": 1})).unwrap();
        let back: Value = read_json_with_backup(&path).unwrap();
        assert_eq!(back["a"], 1);
    }

    #[test]
    fn test_backup_kept_on_rewrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");

        write_atomic_with_backup(&path, &json!({"v": 1})).unwrap();
        write_atomic_with_backup(&path, &json!({"v": 2})).unwrap();

        let current: Value = read_json_with_backup(&path).unwrap();
        assert_eq!(current["v"], 2);

        let bak: Value =
            serde_json::from_str(&fs::read_to_string(bak_path(&path)).unwrap()).unwrap();
        assert_eq!(bak["v"], 1);
    }

    #[test]
    fn test_corrupt_primary_falls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");

        write_atomic_with_backup(&path, &json!({"v": 1})).unwrap();
        write_atomic_with_backup(&path, &json!({"v": 2})).unwrap();
        fs::write(&path, "{ not json").unwrap();

        let recovered: Value = read_json_with_backup(&path).unwrap();
        assert_eq!(recovered["v"], 1);
    }

    #[test]
    fn test_missing_both_is_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert!(read_json_with_backup::<Value>(&path).is_none());
    }
}
