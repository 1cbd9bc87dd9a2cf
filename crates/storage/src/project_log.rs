//! Append-only per-project event logs.
//!
//! One line per event, `[ISO-8601][LEVEL] message`. A line identical to the
//! immediately preceding one is dropped so a renderer repeating the same
//! stderr complaint does not flood the file.

use chrono::Utc;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Writer for `logs/project-<id>.log` files.
pub struct ProjectLog {
    dir: PathBuf,
    last_line: Mutex<HashMap<String, String>>,
}

impl ProjectLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            last_line: Mutex::new(HashMap::new()),
        }
    }

    pub fn path_for(&self, project: &str) -> PathBuf {
        self.dir.join(format!("project-{}.log", project))
    }

    pub fn info(&self, project: &str, message: &str) {
        self.append(project, "INFO", message);
    }

    pub fn error(&self, project: &str, message: &str) {
        self.append(project, "ERROR", message);
    }

    fn append(&self, project: &str, level: &str, message: &str) {
        let line = format!("[{}] {}", level, message.trim_end());
        {
            let mut last = self.last_line.lock().unwrap();
            if last.get(project).is_some_and(|prev| prev == &line) {
                return;
            }
            last.insert(project.to_string(), line.clone());
        }

        let stamped = format!("[{}]{}\n", Utc::now().to_rfc3339(), line);
        if let Err(e) = self.write_line(project, &stamped) {
            warn!(project = %project, error = %e, "Failed to append project log");
        }
    }

    fn write_line(&self, project: &str, line: &str) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(project))?;
        file.write_all(line.as_bytes())
    }

    /// Remove a project's log file (project deletion).
    pub fn remove(&self, project: &str) {
        let _ = fs::remove_file(self.path_for(project));
        self.last_line.lock().unwrap().remove(project);
    }
}

/// Convenience for tests and tooling: read all lines of a project log.
pub fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_and_format() {
        let dir = tempdir().unwrap();
        let log = ProjectLog::new(dir.path());

        log.info("orto", "job started");
        log.error("orto", "renderer stderr: boom");

        let lines = read_lines(&log.path_for("orto"));
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[INFO] job started"));
        assert!(lines[1].contains("[ERROR] renderer stderr: boom"));
        // ISO timestamp prefix
        assert!(lines[0].starts_with('['));
    }

    #[test]
    fn test_duplicate_suppression() {
        let dir = tempdir().unwrap();
        let log = ProjectLog::new(dir.path());

        log.error("orto", "same message");
        log.error("orto", "same message");
        log.error("orto", "other message");
        log.error("orto", "same message");

        let lines = read_lines(&log.path_for("orto"));
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_projects_do_not_share_dedupe_state() {
        let dir = tempdir().unwrap();
        let log = ProjectLog::new(dir.path());

        log.info("a", "msg");
        log.info("b", "msg");

        assert_eq!(read_lines(&log.path_for("a")).len(), 1);
        assert_eq!(read_lines(&log.path_for("b")).len(), 1);
    }
}
