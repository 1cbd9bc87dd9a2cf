//! Render-job lifecycle: admission, renderer spawning, progress streaming,
//! throttled persistence, abort escalation, and orphan reconciliation.
//!
//! One job per `(project, mode, name)` at a time, a global cap on running
//! jobs, and a pid record on disk for every live child so any instance can
//! take a job down after a restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use storage::{CacheLayout, ProjectLog, TargetKind};
use tile_common::{sanitize_storage_name, TileError, TileMatrixSetPreset, TileResult};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config_store::ConfigStore;
use crate::index_store::{IndexEntry, IndexStore};
use crate::procs;
use crate::projects;
use crate::settings::Settings;

/// Bounded stdout/stderr retention per job.
const OUTPUT_TAIL_LIMIT: usize = 200;

/// How long the abort pipeline polls for matcher-visible pids to die before
/// reporting failure, on top of `ABORT_GRACE_MS`.
const ABORT_POLL_BASE_MS: u64 = 2_000;

// ============================================================================
// Request / plan
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RecacheOverlap {
    pub min: Option<u32>,
    pub max: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RecacheRequest {
    pub mode: Option<String>,
    pub overlap: Option<RecacheOverlap>,
}

/// Body of `POST /generate-cache`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GenerateCacheRequest {
    pub project: Option<String>,
    pub layer: Option<String>,
    pub theme: Option<String>,
    pub zoom_min: Option<u32>,
    pub zoom_max: Option<u32>,
    pub scheme: Option<String>,
    pub xyz_mode: Option<String>,
    pub tile_crs: Option<String>,
    pub wmts: Option<bool>,
    pub project_extent: Option<Vec<f64>>,
    pub extent_crs: Option<String>,
    pub allow_remote: Option<bool>,
    pub throttle_ms: Option<u64>,
    pub render_timeout_ms: Option<u64>,
    pub tile_retries: Option<u32>,
    pub png_compression: Option<u32>,
    pub recache: Option<RecacheRequest>,
    pub tile_matrix_preset: Option<String>,
    pub publish_zoom_min: Option<u32>,
    pub publish_zoom_max: Option<u32>,
    pub run_reason: Option<String>,
    pub trigger: Option<String>,
    pub run_id: Option<String>,
    pub batch_index: Option<u64>,
    pub batch_total: Option<u64>,
    pub viewer_session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecacheMode {
    Full,
    Incremental,
}

/// How a run relates to whatever is already cached for the target.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecachePlan {
    pub mode: RecacheMode,
    pub skip_existing: bool,
}

/// Decide full vs incremental per the previous index entry: incremental
/// only when explicitly requested, a prior zoom range exists, the tile CRS
/// is unchanged, and the requested range differs from the previous one.
pub fn compute_recache_plan(
    requested_incremental: bool,
    existing: Option<&IndexEntry>,
    tile_crs: &str,
    zoom_min: u32,
    zoom_max: u32,
) -> RecachePlan {
    if requested_incremental {
        if let Some(entry) = existing {
            if let (Some(prev_min), Some(prev_max)) = (entry.zoom_min, entry.zoom_max) {
                let crs_matches = entry.tile_crs.as_deref() == Some(tile_crs);
                let range_differs = (prev_min, prev_max) != (zoom_min, zoom_max);
                if crs_matches && range_differs {
                    let overlaps = zoom_min <= prev_max && zoom_max >= prev_min;
                    return RecachePlan {
                        mode: RecacheMode::Incremental,
                        skip_existing: !overlaps,
                    };
                }
            }
        }
    }
    RecachePlan {
        mode: RecacheMode::Full,
        skip_existing: false,
    }
}

// ============================================================================
// Job state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Aborting,
    Aborted,
    Completed,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Aborting => "aborting",
            JobStatus::Aborted => "aborted",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Aborted | JobStatus::Completed | JobStatus::Error)
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobMetadata {
    pub output_dir: Option<String>,
    pub storage_name: Option<String>,
    pub tile_crs: Option<String>,
    pub scheme: Option<String>,
    pub xyz_mode: Option<String>,
    pub expected_total: Option<u64>,
    pub project_extent: Option<Vec<f64>>,
    pub project_crs: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProgressSnapshot {
    pub total_generated: Option<u64>,
    pub expected_total: Option<u64>,
    pub percent: Option<f64>,
    pub status: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    pub project: String,
    pub target_mode: String,
    pub target_name: String,
    pub key: String,
    pub pid: Option<u32>,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub stdout_tail: VecDeque<String>,
    pub stderr_tail: VecDeque<String>,
    pub metadata: JobMetadata,
    pub last_progress: ProgressSnapshot,
    pub last_index_write_at: Option<DateTime<Utc>>,
    pub last_config_write_at: Option<DateTime<Utc>>,
    pub viewer_session_id: Option<String>,
    pub run_id: Option<String>,
    pub run_reason: Option<String>,
    pub batch_index: Option<u64>,
    pub batch_total: Option<u64>,
    pub trigger: String,
    pub recache_plan: RecachePlan,
    pub tile_base_dir: PathBuf,
    pub zoom_min: u32,
    pub zoom_max: u32,
    pub publish_zoom_min: u32,
    pub publish_zoom_max: u32,
    pub tile_crs: String,
    pub scheme: String,
    pub xyz_mode: String,
    pub tile_matrix_preset: Option<String>,
    pub prev_cached_zoom: Option<(u32, u32)>,
}

impl JobRecord {
    /// API view of the job; `tail` bounds the stdout/stderr excerpt.
    pub fn snapshot(&self, tail: usize) -> Value {
        let tail_of = |buf: &VecDeque<String>| -> Vec<String> {
            buf.iter()
                .rev()
                .take(tail)
                .cloned()
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect()
        };
        json!({
            "id": self.id,
            "project": self.project,
            "target": self.target_name,
            "targetMode": self.target_mode,
            "status": self.status.as_str(),
            "startedAt": self.started_at,
            "endedAt": self.ended_at,
            "exitCode": self.exit_code,
            "trigger": self.trigger,
            "runId": self.run_id,
            "runReason": self.run_reason,
            "batchIndex": self.batch_index,
            "batchTotal": self.batch_total,
            "viewerSessionId": self.viewer_session_id,
            "pid": self.pid,
            "recachePlan": self.recache_plan,
            "zoomMin": self.zoom_min,
            "zoomMax": self.zoom_max,
            "publishZoomMin": self.publish_zoom_min,
            "publishZoomMax": self.publish_zoom_max,
            "tileMatrixPreset": self.tile_matrix_preset,
            "lastProgress": {
                "totalGenerated": self.last_progress.total_generated,
                "expectedTotal": self.last_progress.expected_total,
                "percent": self.last_progress.percent,
                "status": self.last_progress.status,
                "updatedAt": self.last_progress.updated_at,
            },
            "lastMessage": self.last_message(),
            "stdout": tail_of(&self.stdout_tail),
            "stderr": tail_of(&self.stderr_tail),
        })
    }

    /// The last few stderr lines, used as the terminal message.
    pub fn last_message(&self) -> Option<String> {
        if self.stderr_tail.is_empty() {
            return None;
        }
        let lines: Vec<String> = self
            .stderr_tail
            .iter()
            .rev()
            .take(5)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        Some(lines.join("\n"))
    }
}

/// On-disk record of a spawned renderer, for cross-instance abort and
/// orphan reconciliation. Versioned so the format can evolve.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PidRecord {
    pub version: u32,
    pub id: String,
    pub pid: u32,
    pub project: String,
    pub target_mode: String,
    pub target_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewer_session_id: Option<String>,
    pub args: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// A renderer process nobody in this instance is tracking.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanJob {
    pub id: String,
    pub pid: u32,
    pub project: Option<String>,
    pub target_name: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    /// `pidfile` or `process`.
    pub source: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedJob {
    pub status: String,
    pub id: String,
    pub target: String,
    pub target_mode: String,
}

// ============================================================================
// Manager
// ============================================================================

pub struct JobManagerInner {
    settings: Arc<Settings>,
    layout: CacheLayout,
    log: Arc<ProjectLog>,
    config: Arc<ConfigStore>,
    index: Arc<IndexStore>,
    presets: Arc<Vec<TileMatrixSetPreset>>,
    jobs: Mutex<HashMap<String, JobRecord>>,
    /// `project:mode:name` -> job id, the per-target uniqueness gate.
    active_keys: Mutex<HashMap<String, String>>,
    orphans: Mutex<HashMap<String, OrphanJob>>,
}

/// Handle to the job subsystem; clones share state.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<JobManagerInner>,
}

impl std::ops::Deref for JobManager {
    type Target = JobManagerInner;

    fn deref(&self) -> &JobManagerInner {
        &self.inner
    }
}

impl JobManager {
    pub fn new(
        settings: Arc<Settings>,
        layout: CacheLayout,
        log: Arc<ProjectLog>,
        config: Arc<ConfigStore>,
        index: Arc<IndexStore>,
        presets: Arc<Vec<TileMatrixSetPreset>>,
    ) -> Self {
        Self {
            inner: Arc::new(JobManagerInner {
                settings,
                layout,
                log,
                config,
                index,
                presets,
                jobs: Mutex::new(HashMap::new()),
                active_keys: Mutex::new(HashMap::new()),
                orphans: Mutex::new(HashMap::new()),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Admission + spawn
    // ------------------------------------------------------------------

    pub async fn start_job(&self, req: GenerateCacheRequest) -> TileResult<StartedJob> {
        let project = projects::resolve_project_id(
            req.project.as_deref().ok_or(TileError::ProjectIdRequired)?,
        )?;
        if !projects::project_exists(&self.settings, &self.layout, &project) {
            return Err(TileError::ProjectNotFound(project));
        }

        let (mode, name) = match (&req.layer, &req.theme) {
            (Some(layer), None) => ("layer", layer.clone()),
            (None, Some(theme)) => ("theme", theme.clone()),
            (None, None) => return Err(TileError::TargetRequired),
            (Some(_), Some(_)) => return Err(TileError::TooManyTargets),
        };
        let trimmed = name.trim();
        if trimmed.is_empty()
            || trimmed.contains('/')
            || trimmed.contains('\\')
            || trimmed.contains("..")
        {
            return Err(TileError::InvalidTargetName(name));
        }
        let name = trimmed.to_string();
        let kind = if mode == "theme" {
            TargetKind::Theme
        } else {
            TargetKind::Layer
        };

        let cfg = self.config.read(&project);
        let existing = self.index.read(&project).entry(mode, &name).cloned();

        let tile_crs = req
            .tile_crs
            .clone()
            .or_else(|| existing.as_ref().and_then(|e| e.tile_crs.clone()))
            .or_else(|| cfg.cache_preferences.tile_crs.clone())
            .unwrap_or_else(|| "EPSG:3857".to_string());

        let zoom_min = req
            .zoom_min
            .or(existing.as_ref().and_then(|e| e.zoom_min))
            .or(cfg.zoom.min)
            .unwrap_or(self.settings.bootstrap_zoom_min);
        let zoom_max = req
            .zoom_max
            .or(existing.as_ref().and_then(|e| e.zoom_max))
            .or(cfg.zoom.max)
            .unwrap_or(self.settings.bootstrap_zoom_max)
            .max(zoom_min);

        let requested_incremental = req
            .recache
            .as_ref()
            .and_then(|r| r.mode.as_deref())
            .is_some_and(|m| m.eq_ignore_ascii_case("incremental"));
        let plan = compute_recache_plan(
            requested_incremental,
            existing.as_ref(),
            &tile_crs,
            zoom_min,
            zoom_max,
        );

        // Preset priority: explicit request, previous binding, first preset
        // covering the tile CRS.
        let tile_matrix_preset = req
            .tile_matrix_preset
            .clone()
            .or_else(|| existing.as_ref().and_then(|e| e.tile_matrix_preset.clone()))
            .or_else(|| {
                let crs = tile_common::CrsId::normalize(&tile_crs)?;
                self.presets
                    .iter()
                    .find(|p| p.supports_crs(&crs))
                    .map(|p| p.id.clone())
            });

        let mut publish_zoom_min = req
            .publish_zoom_min
            .or(existing.as_ref().and_then(|e| e.published_zoom_min))
            .unwrap_or(self.settings.publish_zoom_min_default);
        let mut publish_zoom_max = req
            .publish_zoom_max
            .or(existing.as_ref().and_then(|e| e.published_zoom_max))
            .unwrap_or(self.settings.publish_zoom_max_default);
        publish_zoom_min = publish_zoom_min.min(zoom_min);
        publish_zoom_max = publish_zoom_max.max(zoom_max).max(publish_zoom_min);

        let tile_base_dir = self
            .layout
            .target_dir(&project, kind, &name)
            .ok_or_else(|| TileError::ProjectNotFound(project.clone()))?;
        let index_path = self
            .layout
            .index_path(&project)
            .ok_or_else(|| TileError::ProjectNotFound(project.clone()))?;

        {
            let jobs = self.jobs.lock().unwrap();
            let running = jobs
                .values()
                .filter(|j| j.status == JobStatus::Running)
                .count();
            if running >= self.settings.job_max {
                return Err(TileError::ServerBusy {
                    running,
                    max: self.settings.job_max,
                });
            }
        }

        let id = Uuid::new_v4().to_string();
        let key = format!("{}:{}:{}", project, mode, name);
        {
            // Check-and-insert with no suspension point in between.
            let mut keys = self.active_keys.lock().unwrap();
            if let Some(active_id) = keys.get(&key) {
                return Err(TileError::JobAlreadyRunning {
                    key,
                    id: active_id.clone(),
                });
            }
            keys.insert(key.clone(), id.clone());
        }

        let scheme = req.scheme.clone().unwrap_or_else(|| "auto".to_string());
        let xyz_mode = req.xyz_mode.clone().unwrap_or_else(|| "partial".to_string());

        let mut args: Vec<String> = vec![
            self.settings.render_script.clone(),
            format!("--{}", mode),
            name.clone(),
            "--zoom_min".to_string(),
            zoom_min.to_string(),
            "--zoom_max".to_string(),
            zoom_max.to_string(),
            "--publish_zoom_min".to_string(),
            publish_zoom_min.to_string(),
            "--publish_zoom_max".to_string(),
            publish_zoom_max.to_string(),
            "--output_dir".to_string(),
            tile_base_dir.to_string_lossy().into_owned(),
            "--index_path".to_string(),
            index_path.to_string_lossy().into_owned(),
            "--scheme".to_string(),
            scheme.clone(),
            "--xyz_mode".to_string(),
            xyz_mode.clone(),
            "--tile_crs".to_string(),
            tile_crs.clone(),
        ];
        if let Some(preset) = &tile_matrix_preset {
            args.push("--tile_matrix_preset".to_string());
            args.push(preset.clone());
        }
        if req.wmts.unwrap_or(false) {
            args.push("--wmts".to_string());
        }
        if req.allow_remote.unwrap_or(cfg.cache_preferences.allow_remote) {
            args.push("--allow_remote".to_string());
        }
        if plan.skip_existing {
            args.push("--skip_existing".to_string());
        }
        let throttle_ms = req.throttle_ms.unwrap_or(cfg.cache_preferences.throttle_ms);
        if throttle_ms > 0 {
            args.push("--throttle_ms".to_string());
            args.push(throttle_ms.to_string());
        }
        args.push("--render_timeout_ms".to_string());
        args.push(
            req.render_timeout_ms
                .unwrap_or(self.settings.render_timeout_ms)
                .to_string(),
        );
        args.push("--tile_retries".to_string());
        args.push(
            req.tile_retries
                .unwrap_or(self.settings.render_tile_retries)
                .to_string(),
        );
        if let Some(compression) = req.png_compression {
            args.push("--png_compression".to_string());
            args.push(compression.min(9).to_string());
        }
        if let Some(extent) = req.project_extent.as_ref().filter(|e| e.len() == 4) {
            args.push("--project_extent4".to_string());
            for v in extent {
                args.push(v.to_string());
            }
            if let Some(crs) = &req.extent_crs {
                args.push("--extent_crs".to_string());
                args.push(crs.clone());
            }
        }
        if let Some(project_file) = projects::resolve_project_file(&self.settings, &project) {
            args.push("--project".to_string());
            args.push(project_file.to_string_lossy().into_owned());
        }
        args.push("--job_id".to_string());
        args.push(id.clone());

        let mut command = Command::new(&self.settings.python_bin);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.active_keys.lock().unwrap().remove(&key);
                return Err(TileError::Internal(format!(
                    "failed to spawn renderer: {}",
                    e
                )));
            }
        };
        let pid = child.id();
        info!(job = %id, project = %project, target = %name, pid, "Renderer spawned");
        self.log.info(
            &project,
            &format!("render job {} started for {} {}", id, mode, name),
        );

        let now = Utc::now();
        let record = JobRecord {
            id: id.clone(),
            project: project.clone(),
            target_mode: mode.to_string(),
            target_name: name.clone(),
            key: key.clone(),
            pid,
            status: JobStatus::Running,
            started_at: now,
            ended_at: None,
            exit_code: None,
            stdout_tail: VecDeque::new(),
            stderr_tail: VecDeque::new(),
            metadata: JobMetadata::default(),
            last_progress: ProgressSnapshot::default(),
            last_index_write_at: None,
            last_config_write_at: None,
            viewer_session_id: req.viewer_session_id.clone(),
            run_id: req.run_id.clone(),
            run_reason: req.run_reason.clone(),
            batch_index: req.batch_index,
            batch_total: req.batch_total,
            trigger: req.trigger.clone().unwrap_or_else(|| "manual".to_string()),
            recache_plan: plan,
            tile_base_dir,
            zoom_min,
            zoom_max,
            publish_zoom_min,
            publish_zoom_max,
            tile_crs,
            scheme,
            xyz_mode,
            tile_matrix_preset,
            prev_cached_zoom: existing
                .as_ref()
                .and_then(|e| Some((e.cached_zoom_min?, e.cached_zoom_max?))),
        };
        self.jobs.lock().unwrap().insert(id.clone(), record);

        if let Some(pid) = pid {
            self.write_pid_record(&id, pid, &project, mode, &name, &req, &args);
        }

        // Manual requests refresh lastParams; timer-triggered runs leave
        // them untouched.
        if req.trigger.as_deref() != Some("timer") {
            let mut cfg = self.config.read(&project);
            let entry = cfg.target_mut(mode, &name);
            entry.last_params = serde_json::to_value(&req).ok().map(strip_run_metadata);
            entry.last_requested_at = Some(now);
            if let Err(e) = self.config.write(&project, cfg, true) {
                warn!(project = %project, error = %e, "Failed to record lastParams");
            }
        }

        let manager = self.clone();
        let job_id = id.clone();
        tokio::spawn(async move {
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();

            let stderr_task = stderr.map(|pipe| {
                let manager = manager.clone();
                let job_id = job_id.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(pipe).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        manager.on_stderr_line(&job_id, &line);
                    }
                })
            });

            if let Some(pipe) = stdout {
                let mut lines = BufReader::new(pipe).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    manager.on_stdout_line(&job_id, &line);
                }
            }

            let exit_code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    error!(job = %job_id, error = %e, "Failed waiting on renderer");
                    None
                }
            };
            if let Some(task) = stderr_task {
                let _ = task.await;
            }
            manager.on_exit(&job_id, exit_code);
        });

        Ok(StartedJob {
            status: "started".to_string(),
            id,
            target: name,
            target_mode: mode.to_string(),
        })
    }

    fn write_pid_record(
        &self,
        id: &str,
        pid: u32,
        project: &str,
        mode: &str,
        name: &str,
        req: &GenerateCacheRequest,
        args: &[String],
    ) {
        let record = PidRecord {
            version: 1,
            id: id.to_string(),
            pid,
            project: project.to_string(),
            target_mode: mode.to_string(),
            target_name: name.to_string(),
            viewer_session_id: req.viewer_session_id.clone(),
            args: args.to_vec(),
            started_at: Some(Utc::now()),
        };
        let dir = self.settings.job_pids_dir();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(error = %e, "Cannot create job-pids directory");
            return;
        }
        let path = dir.join(format!("{}.json", id));
        match serde_json::to_vec_pretty(&record) {
            Ok(body) => {
                if let Err(e) = std::fs::write(&path, body) {
                    warn!(job = %id, error = %e, "Failed to write pid record");
                }
            }
            Err(e) => warn!(job = %id, error = %e, "Failed to serialize pid record"),
        }
    }

    fn remove_pid_record(&self, id: &str) {
        let path = self.settings.job_pids_dir().join(format!("{}.json", id));
        let _ = std::fs::remove_file(path);
    }

    // ------------------------------------------------------------------
    // Progress streaming
    // ------------------------------------------------------------------

    fn on_stdout_line(&self, id: &str, line: &str) {
        {
            let mut jobs = self.jobs.lock().unwrap();
            if let Some(job) = jobs.get_mut(id) {
                job.stdout_tail.push_back(line.to_string());
                if job.stdout_tail.len() > OUTPUT_TAIL_LIMIT {
                    job.stdout_tail.pop_front();
                }
            } else {
                return;
            }
        }

        let Ok(event) = serde_json::from_str::<Value>(line) else {
            return;
        };

        if event.get("debug").and_then(Value::as_str) == Some("start_generate") {
            self.on_start_generate(id, &event);
            return;
        }

        let is_progress = event.get("progress").is_some()
            || event.get("status").is_some()
            || event.get("debug").and_then(Value::as_str) == Some("index_written");
        if !is_progress {
            return;
        }

        let now = Utc::now();
        let mut status_changed = false;
        let mut flush_index = false;
        let mut flush_config = false;
        {
            let mut jobs = self.jobs.lock().unwrap();
            let Some(job) = jobs.get_mut(id) else { return };

            if let Some(total) = event.get("total_generated").and_then(Value::as_u64) {
                job.last_progress.total_generated = Some(total);
            }
            if let Some(expected) = event.get("expected_total").and_then(Value::as_u64) {
                job.last_progress.expected_total = Some(expected);
            }
            if let Some(status) = event.get("status").and_then(Value::as_str) {
                status_changed = job.last_progress.status.as_deref() != Some(status);
                job.last_progress.status = Some(status.to_string());
            }
            job.last_progress.percent = match (
                job.last_progress.total_generated,
                job.last_progress.expected_total,
            ) {
                (Some(generated), Some(expected)) if expected > 0 => {
                    Some((100.0 * generated as f64 / expected as f64).clamp(0.0, 100.0))
                }
                _ => None,
            };
            job.last_progress.updated_at = Some(now);

            let index_due = job.last_index_write_at.map_or(true, |at| {
                (now - at).num_milliseconds() as u64 >= self.settings.index_flush_interval_ms
            });
            if status_changed || index_due {
                job.last_index_write_at = Some(now);
                flush_index = true;
            }
            let config_due = job.last_config_write_at.map_or(true, |at| {
                (now - at).num_milliseconds() as u64
                    >= self.settings.progress_config_interval_ms
            });
            if status_changed || config_due {
                job.last_config_write_at = Some(now);
                flush_config = true;
            }
        }

        if flush_index {
            self.flush_index(id, None);
        }
        if flush_config {
            self.flush_config(id, None);
        }
    }

    fn on_start_generate(&self, id: &str, event: &Value) {
        {
            let mut jobs = self.jobs.lock().unwrap();
            let Some(job) = jobs.get_mut(id) else { return };
            let meta = &mut job.metadata;
            meta.output_dir = event
                .get("output_dir")
                .and_then(Value::as_str)
                .map(str::to_string);
            meta.storage_name = event
                .get("storage_name")
                .and_then(Value::as_str)
                .map(str::to_string);
            meta.tile_crs = event
                .get("tile_crs")
                .and_then(Value::as_str)
                .map(str::to_string);
            meta.scheme = event
                .get("scheme")
                .and_then(Value::as_str)
                .map(str::to_string);
            meta.xyz_mode = event
                .get("xyz_mode")
                .and_then(Value::as_str)
                .map(str::to_string);
            meta.expected_total = event.get("expected_total").and_then(Value::as_u64);
            meta.project_crs = event
                .get("project_crs")
                .and_then(Value::as_str)
                .map(str::to_string);
            meta.project_extent = event.get("project_extent").and_then(|v| {
                serde_json::from_value::<Vec<f64>>(v.clone()).ok()
            });

            job.last_progress.expected_total = meta.expected_total;
            job.last_progress.total_generated = Some(0);
            job.last_progress.status = Some("running".to_string());
            let now = Utc::now();
            job.last_progress.updated_at = Some(now);
            job.last_index_write_at = Some(now);
            job.last_config_write_at = Some(now);
        }
        // First event forces a zero-progress write so the UI sees the run
        // immediately.
        self.flush_index(id, None);
        self.flush_config(id, None);
    }

    fn on_stderr_line(&self, id: &str, line: &str) {
        let project = {
            let mut jobs = self.jobs.lock().unwrap();
            let Some(job) = jobs.get_mut(id) else { return };
            job.stderr_tail.push_back(line.to_string());
            if job.stderr_tail.len() > OUTPUT_TAIL_LIMIT {
                job.stderr_tail.pop_front();
            }
            job.project.clone()
        };
        self.log.error(&project, line);
    }

    /// Write the job's current progress into the cache index.
    fn flush_index(&self, id: &str, terminal: Option<JobStatus>) {
        let Some(job) = self.jobs.lock().unwrap().get(id).cloned() else {
            return;
        };

        let status = terminal.unwrap_or(job.status);
        let relative_path = match job.target_mode.as_str() {
            "theme" => format!(
                "{}/{}/{}",
                job.project,
                storage::THEMES_DIR,
                sanitize_storage_name(&job.target_name)
            ),
            _ => format!(
                "{}/{}",
                job.project,
                sanitize_storage_name(&job.target_name)
            ),
        };

        let result = self.index.upsert_entry(
            &job.project,
            &job.target_mode,
            &job.target_name,
            |mut entry| {
                entry.scheme = Some(job.scheme.clone());
                entry.tile_crs = Some(job.tile_crs.clone());
                entry.xyz_mode = Some(job.xyz_mode.clone());
                entry.tile_format = Some("png".to_string());
                entry.cacheable = Some(true);
                entry.zoom_min = Some(job.zoom_min);
                entry.zoom_max = Some(job.zoom_max);
                entry.published_zoom_min = Some(job.publish_zoom_min);
                entry.published_zoom_max = Some(job.publish_zoom_max);
                entry.tile_matrix_preset = job.tile_matrix_preset.clone();
                entry.path = Some(relative_path.clone());
                entry.status = Some(status.as_str().to_string());
                entry.progress = Some(json!({
                    "totalGenerated": job.last_progress.total_generated,
                    "expectedTotal": job.last_progress.expected_total,
                    "percent": job.last_progress.percent,
                    "status": job.last_progress.status,
                    "updatedAt": job.last_progress.updated_at,
                }));
                if let Some(extent) = &job.metadata.project_extent {
                    entry.extent = Some(extent.clone());
                }
                if let Some(crs) = &job.metadata.project_crs {
                    entry.crs = Some(crs.clone());
                }
                entry.cache_exists = Some(true);
                entry.cache_removed_at = None;

                match status {
                    JobStatus::Completed => {
                        let (min, max) = match (job.recache_plan.mode, job.prev_cached_zoom) {
                            (RecacheMode::Incremental, Some((prev_min, prev_max))) => (
                                prev_min.min(job.zoom_min),
                                prev_max.max(job.zoom_max),
                            ),
                            _ => (job.zoom_min, job.zoom_max),
                        };
                        entry.last_zoom_min = entry.cached_zoom_min;
                        entry.last_zoom_max = entry.cached_zoom_max;
                        entry.cached_zoom_min = Some(min);
                        entry.cached_zoom_max = Some(max);
                        entry.generated = Some(Utc::now());
                        entry.tile_count = job.last_progress.total_generated;
                        entry.partial = Some(false);
                    }
                    JobStatus::Error | JobStatus::Aborted => {
                        entry.partial = Some(true);
                    }
                    _ => {}
                }
                entry
            },
        );
        if let Err(e) = result {
            warn!(job = %id, error = %e, "Index flush failed");
        }
    }

    /// Write the job's current progress into the project config.
    fn flush_config(&self, id: &str, terminal: Option<JobStatus>) {
        let Some(job) = self.jobs.lock().unwrap().get(id).cloned() else {
            return;
        };
        let status = terminal.unwrap_or(job.status);

        let mut cfg = self.config.read(&job.project);
        {
            let entry = cfg.target_mut(&job.target_mode, &job.target_name);
            entry.progress = Some(json!({
                "totalGenerated": job.last_progress.total_generated,
                "expectedTotal": job.last_progress.expected_total,
                "percent": job.last_progress.percent,
                "status": status.as_str(),
                "updatedAt": job.last_progress.updated_at,
            }));
            if status.is_terminal() {
                entry.last_result = Some(status.as_str().to_string());
                entry.last_run_at = Some(Utc::now());
                entry.last_message = job.last_message();
            }
        }
        if let Err(e) = self.config.write(&job.project, cfg, true) {
            warn!(job = %id, error = %e, "Config flush failed");
        }
    }

    // ------------------------------------------------------------------
    // Termination
    // ------------------------------------------------------------------

    fn on_exit(&self, id: &str, exit_code: Option<i32>) {
        let (project, final_status) = {
            let mut jobs = self.jobs.lock().unwrap();
            let Some(job) = jobs.get_mut(id) else { return };
            let final_status = match job.status {
                JobStatus::Aborting | JobStatus::Aborted => JobStatus::Aborted,
                _ if exit_code == Some(0) => JobStatus::Completed,
                _ => JobStatus::Error,
            };
            job.status = final_status;
            job.ended_at = Some(Utc::now());
            job.exit_code = exit_code;
            (job.project.clone(), final_status)
        };

        info!(job = %id, project = %project, status = final_status.as_str(), exit_code, "Renderer exited");
        self.log.info(
            &project,
            &format!("render job {} finished: {}", id, final_status.as_str()),
        );

        self.flush_index(id, Some(final_status));
        self.flush_config(id, Some(final_status));
        self.release_job(id);
        self.schedule_cleanup(id);
    }

    fn release_job(&self, id: &str) {
        let key = self
            .jobs
            .lock()
            .unwrap()
            .get(id)
            .map(|job| job.key.clone());
        if let Some(key) = key {
            let mut keys = self.active_keys.lock().unwrap();
            if keys.get(&key).map(String::as_str) == Some(id) {
                keys.remove(&key);
            }
        }
    }

    fn schedule_cleanup(&self, id: &str) {
        let manager = self.clone();
        let id = id.to_string();
        let ttl = self.settings.job_ttl_ms;
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(ttl)).await;
            manager.jobs.lock().unwrap().remove(&id);
            manager.remove_pid_record(&id);
        });
    }

    /// All pids the abort matchers currently see for a job.
    fn matching_pids(&self, job_id: &str, output_dir: Option<&str>) -> Vec<u32> {
        let sys = procs::snapshot();
        let own = std::process::id();

        let mut pids =
            procs::pids_with_cmdline(&sys, &[self.settings.render_script.as_str(), job_id]);
        let descendants = procs::descendants_of(&sys, &pids);
        pids.extend(descendants);
        if let Some(dir) = output_dir.filter(|d| !d.is_empty()) {
            pids.extend(procs::pids_with_cmdline(&sys, &[dir]));
        }
        pids.retain(|pid| *pid != own);
        pids.sort_unstable();
        pids.dedup();
        pids
    }

    async fn kill_and_confirm(
        &self,
        job_id: &str,
        pid: Option<u32>,
        output_dir: Option<&str>,
    ) -> Result<(), Vec<u32>> {
        if let Some(pid) = pid {
            procs::terminate_group(pid);
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let pids = self.matching_pids(job_id, output_dir);
        if !pids.is_empty() {
            let sys = procs::snapshot();
            procs::kill_pids(&sys, &pids);
        }
        if let Some(pid) = pid {
            let sys = procs::snapshot();
            procs::kill_pids(&sys, &[pid]);
        }

        let deadline = tokio::time::Instant::now()
            + std::time::Duration::from_millis(
                ABORT_POLL_BASE_MS + self.settings.abort_grace_ms,
            );
        loop {
            let mut alive = self.matching_pids(job_id, output_dir);
            if let Some(pid) = pid {
                if procs::pid_alive(pid) {
                    alive.push(pid);
                }
            }
            if alive.is_empty() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                alive.sort_unstable();
                alive.dedup();
                return Err(alive);
            }
            tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        }
    }

    /// Abort a job: mark, kill the process tree, confirm, finalize.
    /// Idempotent; aborting an already-terminal job succeeds.
    pub async fn abort_job(&self, id: &str) -> TileResult<()> {
        let local = {
            let mut jobs = self.jobs.lock().unwrap();
            match jobs.get_mut(id) {
                Some(job) => {
                    if job.status.is_terminal() {
                        return Ok(());
                    }
                    job.status = JobStatus::Aborting;
                    Some((
                        job.pid,
                        job.metadata
                            .output_dir
                            .clone()
                            .unwrap_or_else(|| job.tile_base_dir.to_string_lossy().into_owned()),
                        job.project.clone(),
                    ))
                }
                None => None,
            }
        };

        match local {
            Some((pid, output_dir, project)) => {
                self.flush_index(id, Some(JobStatus::Aborting));
                self.log.info(&project, &format!("aborting render job {}", id));

                match self.kill_and_confirm(id, pid, Some(&output_dir)).await {
                    Ok(()) => {
                        {
                            let mut jobs = self.jobs.lock().unwrap();
                            if let Some(job) = jobs.get_mut(id) {
                                job.status = JobStatus::Aborted;
                                job.ended_at = Some(Utc::now());
                            }
                        }
                        self.flush_index(id, Some(JobStatus::Aborted));
                        self.flush_config(id, Some(JobStatus::Aborted));
                        self.release_job(id);
                        self.remove_pid_record(id);
                        self.schedule_cleanup(id);
                        Ok(())
                    }
                    Err(pids) => Err(TileError::AbortFailed {
                        id: id.to_string(),
                        pids,
                    }),
                }
            }
            None => self.abort_foreign_job(id).await,
        }
    }

    /// Abort a job tracked by another instance, from its pid record.
    async fn abort_foreign_job(&self, id: &str) -> TileResult<()> {
        let path = self.settings.job_pids_dir().join(format!("{}.json", id));
        let record: PidRecord = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|_| TileError::JobNotFound(id.to_string()))?,
            Err(_) => return Err(TileError::JobNotFound(id.to_string())),
        };

        let output_dir = record
            .args
            .iter()
            .position(|a| a == "--output_dir")
            .and_then(|pos| record.args.get(pos + 1))
            .cloned();

        match self
            .kill_and_confirm(id, Some(record.pid), output_dir.as_deref())
            .await
        {
            Ok(()) => {
                self.remove_pid_record(id);
                self.orphans.lock().unwrap().remove(id);
                Ok(())
            }
            Err(pids) => Err(TileError::AbortFailed {
                id: id.to_string(),
                pids,
            }),
        }
    }

    /// Abort every live job of a project and wait for the records to reach
    /// a terminal state. Used by project deletion.
    pub async fn abort_jobs_for_project(&self, project: &str) -> TileResult<()> {
        let ids: Vec<String> = {
            let jobs = self.jobs.lock().unwrap();
            jobs.values()
                .filter(|j| j.project == project && !j.status.is_terminal())
                .map(|j| j.id.clone())
                .collect()
        };
        for id in &ids {
            if let Err(e) = self.abort_job(id).await {
                warn!(project = %project, job = %id, error = %e, "Abort during project delete failed");
            }
        }

        let deadline =
            tokio::time::Instant::now() + std::time::Duration::from_secs(10);
        loop {
            let still_live = {
                let jobs = self.jobs.lock().unwrap();
                jobs.values()
                    .any(|j| j.project == project && !j.status.is_terminal())
            };
            if !still_live {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TileError::JobAbortFailed(project.to_string()));
            }
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        }
    }

    /// Abort jobs started by a given viewer session.
    pub async fn abort_jobs_for_session(&self, sid: &str) {
        let ids: Vec<String> = {
            let jobs = self.jobs.lock().unwrap();
            jobs.values()
                .filter(|j| {
                    j.viewer_session_id.as_deref() == Some(sid) && !j.status.is_terminal()
                })
                .map(|j| j.id.clone())
                .collect()
        };
        for id in ids {
            if let Err(e) = self.abort_job(&id).await {
                warn!(sid = %sid, job = %id, error = %e, "Session abort failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn job_snapshot(&self, id: &str, tail: usize) -> Option<Value> {
        self.jobs.lock().unwrap().get(id).map(|j| j.snapshot(tail))
    }

    pub fn running_snapshots(&self) -> Vec<Value> {
        self.jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| !j.status.is_terminal())
            .map(|j| j.snapshot(5))
            .collect()
    }

    pub fn jobs_for_target(&self, project: &str, name: Option<&str>) -> Vec<String> {
        self.jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| {
                j.project == project
                    && !j.status.is_terminal()
                    && name.map_or(true, |n| j.target_name == n)
            })
            .map(|j| j.id.clone())
            .collect()
    }

    /// Whether any live job is writing the given target.
    pub fn target_busy(&self, project: &str, name: &str) -> Option<String> {
        self.jobs
            .lock()
            .unwrap()
            .values()
            .find(|j| j.project == project && j.target_name == name && !j.status.is_terminal())
            .map(|j| j.id.clone())
    }

    /// Diagnostic view: every pid the abort matchers would touch for a job.
    pub fn diagnose(&self, id: &str) -> Value {
        let output_dir = self.jobs.lock().unwrap().get(id).and_then(|j| {
            j.metadata
                .output_dir
                .clone()
                .or_else(|| Some(j.tile_base_dir.to_string_lossy().into_owned()))
        });
        let pids = self.matching_pids(id, output_dir.as_deref());
        json!({
            "id": id,
            "outputDir": output_dir,
            "matchingPids": pids,
        })
    }

    // ------------------------------------------------------------------
    // Orphans
    // ------------------------------------------------------------------

    /// Reconcile on-disk pid records and the process table against the
    /// (empty at boot) in-memory job map.
    pub fn scan_orphans(&self) {
        let dir = self.settings.job_pids_dir();
        let mut found: HashMap<String, OrphanJob> = HashMap::new();
        let mut recorded_pids: Vec<u32> = Vec::new();

        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Ok(raw) = std::fs::read_to_string(&path) else {
                    continue;
                };
                let Ok(record) = serde_json::from_str::<PidRecord>(&raw) else {
                    warn!(path = %path.display(), "Unreadable pid record");
                    continue;
                };
                recorded_pids.push(record.pid);
                let tracked = self.jobs.lock().unwrap().contains_key(&record.id);
                if tracked {
                    continue;
                }
                if procs::pid_alive(record.pid) {
                    found.insert(
                        record.id.clone(),
                        OrphanJob {
                            id: record.id.clone(),
                            pid: record.pid,
                            project: Some(record.project.clone()),
                            target_name: Some(record.target_name.clone()),
                            started_at: record.started_at,
                            source: "pidfile".to_string(),
                        },
                    );
                } else {
                    // Stale record for a dead process: clean it up.
                    let _ = std::fs::remove_file(&path);
                }
            }
        }

        // Renderer processes with no record at all.
        let sys = procs::snapshot();
        for pid in procs::pids_with_cmdline(&sys, &[self.settings.render_script.as_str()]) {
            if pid == std::process::id() || recorded_pids.contains(&pid) {
                continue;
            }
            let id = format!("orphan-{}", pid);
            found.entry(id.clone()).or_insert(OrphanJob {
                id,
                pid,
                project: None,
                target_name: None,
                started_at: None,
                source: "process".to_string(),
            });
        }

        if !found.is_empty() {
            info!(count = found.len(), "Orphan renderer processes detected");
        }
        *self.orphans.lock().unwrap() = found;
    }

    pub fn list_orphans(&self) -> Vec<OrphanJob> {
        // Re-check liveness so the listing never shows already-dead pids.
        let mut orphans = self.orphans.lock().unwrap();
        orphans.retain(|_, orphan| procs::pid_alive(orphan.pid));
        orphans.values().cloned().collect()
    }

    pub async fn kill_orphan(&self, id: &str) -> TileResult<()> {
        let orphan = self
            .orphans
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| TileError::JobNotFound(id.to_string()))?;

        match self.kill_and_confirm(&orphan.id, Some(orphan.pid), None).await {
            Ok(()) => {
                self.orphans.lock().unwrap().remove(id);
                if orphan.source == "pidfile" {
                    self.remove_pid_record(id);
                }
                Ok(())
            }
            Err(pids) => Err(TileError::AbortFailed {
                id: id.to_string(),
                pids,
            }),
        }
    }

    /// Kill an arbitrary pid, restricted to renderer-looking processes.
    pub fn kill_pid(&self, pid: u32) -> TileResult<()> {
        let sys = procs::snapshot();
        let renderers = procs::pids_with_cmdline(&sys, &[self.settings.render_script.as_str()]);
        let workers = procs::pids_with_cmdline(&sys, &[self.settings.tile_worker_script.as_str()]);
        if !renderers.contains(&pid) && !workers.contains(&pid) {
            return Err(TileError::JobNotFound(format!("pid {}", pid)));
        }
        procs::kill_pids(&sys, &[pid]);
        Ok(())
    }
}

/// Drop run metadata (and unset fields) from a request body before storing
/// it as lastParams, so a replay does not inherit batch/session identity.
fn strip_run_metadata(mut value: Value) -> Value {
    if let Some(obj) = value.as_object_mut() {
        for key in [
            "run_reason",
            "trigger",
            "run_id",
            "batch_index",
            "batch_total",
            "viewer_session_id",
            "project",
        ] {
            obj.remove(key);
        }
        obj.retain(|_, v| !v.is_null());
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_manager(dir: &std::path::Path) -> JobManager {
        let mut settings = Settings::from_env();
        settings.cache_dir = dir.join("cache");
        settings.data_dir = dir.join("data");
        settings.logs_dir = dir.join("logs");
        settings.projects_dir = dir.join("projects");
        let settings = Arc::new(settings);
        let layout = CacheLayout::new(&settings.cache_dir);
        let log = Arc::new(ProjectLog::new(&settings.logs_dir));
        let config = Arc::new(ConfigStore::new(layout.clone(), settings.clone()));
        let index = Arc::new(IndexStore::new(layout.clone(), settings.clone()));
        JobManager::new(settings, layout, log, config, index, Arc::new(Vec::new()))
    }

    fn dummy_record(id: &str, key: &str, status: JobStatus) -> JobRecord {
        JobRecord {
            id: id.to_string(),
            project: "orto".to_string(),
            target_mode: "layer".to_string(),
            target_name: "parcels".to_string(),
            key: key.to_string(),
            pid: None,
            status,
            started_at: Utc::now(),
            ended_at: None,
            exit_code: None,
            stdout_tail: VecDeque::new(),
            stderr_tail: VecDeque::new(),
            metadata: JobMetadata::default(),
            last_progress: ProgressSnapshot::default(),
            last_index_write_at: None,
            last_config_write_at: None,
            viewer_session_id: None,
            run_id: None,
            run_reason: None,
            batch_index: None,
            batch_total: None,
            trigger: "manual".to_string(),
            recache_plan: RecachePlan {
                mode: RecacheMode::Full,
                skip_existing: false,
            },
            tile_base_dir: PathBuf::from("/tmp"),
            zoom_min: 0,
            zoom_max: 3,
            publish_zoom_min: 0,
            publish_zoom_max: 20,
            tile_crs: "EPSG:3857".to_string(),
            scheme: "xyz".to_string(),
            xyz_mode: "partial".to_string(),
            tile_matrix_preset: None,
            prev_cached_zoom: None,
        }
    }

    fn request(project: &str, layer: Option<&str>, theme: Option<&str>) -> GenerateCacheRequest {
        GenerateCacheRequest {
            project: Some(project.to_string()),
            layer: layer.map(str::to_string),
            theme: theme.map(str::to_string),
            zoom_min: Some(0),
            zoom_max: Some(3),
            scheme: Some("xyz".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_admission_argument_errors() {
        let dir = tempdir().unwrap();
        let manager = make_manager(dir.path());

        let err = manager.start_job(GenerateCacheRequest::default()).await;
        assert!(matches!(err, Err(TileError::ProjectIdRequired)));

        let err = manager.start_job(request("ghost", Some("parcels"), None)).await;
        assert!(matches!(err, Err(TileError::ProjectNotFound(_))));

        std::fs::create_dir_all(dir.path().join("cache/orto")).unwrap();

        let err = manager.start_job(request("orto", None, None)).await;
        assert!(matches!(err, Err(TileError::TargetRequired)));

        let err = manager
            .start_job(request("orto", Some("a"), Some("b")))
            .await;
        assert!(matches!(err, Err(TileError::TooManyTargets)));

        let err = manager
            .start_job(request("orto", Some("../escape"), None))
            .await;
        assert!(matches!(err, Err(TileError::InvalidTargetName(_))));
    }

    #[tokio::test]
    async fn test_per_target_uniqueness() {
        let dir = tempdir().unwrap();
        let manager = make_manager(dir.path());
        std::fs::create_dir_all(dir.path().join("cache/orto")).unwrap();

        manager
            .active_keys
            .lock()
            .unwrap()
            .insert("orto:layer:parcels".to_string(), "existing-id".to_string());

        let err = manager
            .start_job(request("orto", Some("parcels"), None))
            .await;
        match err {
            Err(TileError::JobAlreadyRunning { id, .. }) => assert_eq!(id, "existing-id"),
            other => panic!("expected job_already_running, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_global_concurrency_cap() {
        let dir = tempdir().unwrap();
        let manager = make_manager(dir.path());
        std::fs::create_dir_all(dir.path().join("cache/orto")).unwrap();

        let max = manager.settings.job_max;
        {
            let mut jobs = manager.jobs.lock().unwrap();
            for i in 0..max {
                let id = format!("job-{}", i);
                jobs.insert(
                    id.clone(),
                    dummy_record(&id, &format!("orto:layer:l{}", i), JobStatus::Running),
                );
            }
        }

        let err = manager
            .start_job(request("orto", Some("parcels"), None))
            .await;
        assert!(matches!(err, Err(TileError::ServerBusy { .. })));
    }

    #[test]
    fn test_release_only_removes_own_key() {
        let dir = tempdir().unwrap();
        let manager = make_manager(dir.path());
        manager.jobs.lock().unwrap().insert(
            "old".to_string(),
            dummy_record("old", "orto:layer:parcels", JobStatus::Completed),
        );
        // A newer job owns the key now.
        manager
            .active_keys
            .lock()
            .unwrap()
            .insert("orto:layer:parcels".to_string(), "new".to_string());

        manager.release_job("old");
        assert_eq!(
            manager
                .active_keys
                .lock()
                .unwrap()
                .get("orto:layer:parcels")
                .map(String::as_str),
            Some("new")
        );
    }

    fn entry_with_range(min: u32, max: u32, crs: &str) -> IndexEntry {
        let mut entry = IndexEntry::new("layer", "parcels");
        entry.zoom_min = Some(min);
        entry.zoom_max = Some(max);
        entry.tile_crs = Some(crs.to_string());
        entry
    }

    #[test]
    fn test_plan_full_without_request() {
        let existing = entry_with_range(0, 5, "EPSG:3857");
        let plan = compute_recache_plan(false, Some(&existing), "EPSG:3857", 0, 8);
        assert_eq!(plan.mode, RecacheMode::Full);
        assert!(!plan.skip_existing);
    }

    #[test]
    fn test_plan_incremental_overlapping() {
        let existing = entry_with_range(0, 5, "EPSG:3857");
        let plan = compute_recache_plan(true, Some(&existing), "EPSG:3857", 3, 8);
        assert_eq!(plan.mode, RecacheMode::Incremental);
        assert!(!plan.skip_existing);
    }

    #[test]
    fn test_plan_incremental_disjoint_skips_existing() {
        let existing = entry_with_range(0, 5, "EPSG:3857");
        let plan = compute_recache_plan(true, Some(&existing), "EPSG:3857", 6, 9);
        assert_eq!(plan.mode, RecacheMode::Incremental);
        assert!(plan.skip_existing);
    }

    #[test]
    fn test_plan_full_on_crs_change() {
        let existing = entry_with_range(0, 5, "EPSG:3857");
        let plan = compute_recache_plan(true, Some(&existing), "EPSG:3006", 0, 8);
        assert_eq!(plan.mode, RecacheMode::Full);
    }

    #[test]
    fn test_plan_full_when_range_identical() {
        let existing = entry_with_range(2, 6, "EPSG:3857");
        let plan = compute_recache_plan(true, Some(&existing), "EPSG:3857", 2, 6);
        assert_eq!(plan.mode, RecacheMode::Full);
    }

    #[test]
    fn test_plan_full_without_history() {
        let plan = compute_recache_plan(true, None, "EPSG:3857", 0, 4);
        assert_eq!(plan.mode, RecacheMode::Full);
        assert!(!plan.skip_existing);
    }

    #[test]
    fn test_strip_run_metadata() {
        let params = json!({
            "zoom_min": 0,
            "run_id": "abc",
            "trigger": "timer",
            "batch_index": 2,
            "project": "orto",
            "viewer_session_id": "sid"
        });
        let stripped = strip_run_metadata(params);
        assert_eq!(stripped.as_object().unwrap().len(), 1);
        assert_eq!(stripped["zoom_min"], 0);
    }

    #[test]
    fn test_last_message_takes_final_stderr_lines() {
        let mut record = JobRecord {
            id: "j".into(),
            project: "p".into(),
            target_mode: "layer".into(),
            target_name: "l".into(),
            key: "p:layer:l".into(),
            pid: None,
            status: JobStatus::Error,
            started_at: Utc::now(),
            ended_at: None,
            exit_code: Some(1),
            stdout_tail: VecDeque::new(),
            stderr_tail: VecDeque::new(),
            metadata: JobMetadata::default(),
            last_progress: ProgressSnapshot::default(),
            last_index_write_at: None,
            last_config_write_at: None,
            viewer_session_id: None,
            run_id: None,
            run_reason: None,
            batch_index: None,
            batch_total: None,
            trigger: "manual".into(),
            recache_plan: RecachePlan {
                mode: RecacheMode::Full,
                skip_existing: false,
            },
            tile_base_dir: PathBuf::from("/tmp"),
            zoom_min: 0,
            zoom_max: 3,
            publish_zoom_min: 0,
            publish_zoom_max: 20,
            tile_crs: "EPSG:3857".into(),
            scheme: "xyz".into(),
            xyz_mode: "partial".into(),
            tile_matrix_preset: None,
            prev_cached_zoom: None,
        };
        for i in 0..8 {
            record.stderr_tail.push_back(format!("line {}", i));
        }
        let message = record.last_message().unwrap();
        let lines: Vec<&str> = message.lines().collect();
        assert_eq!(lines, vec!["line 3", "line 4", "line 5", "line 6", "line 7"]);
    }

    #[test]
    fn test_job_status_terminality() {
        assert!(JobStatus::Aborted.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Aborting.is_terminal());
    }
}
