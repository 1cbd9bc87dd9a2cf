//! On-demand tile rendering through a persistent renderer worker pool.
//!
//! Workers are long-lived child processes speaking one JSON object per line
//! on stdin/stdout. Requests for the same tile coalesce onto one in-flight
//! render; every caller awaits the same outcome. Viewer sessions can abort
//! their queued work, and an admin can pause the whole pool.

use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use storage::{tile_file_status, TileFileStatus};
use tile_common::{
    tile::web_mercator_tile_bbox, BoundingBox, TileCoord, TileError, TileMatrixSetPreset,
    TileResult,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::config_store::ConfigStore;
use crate::index_store::IndexStore;
use crate::projects;
use crate::settings::Settings;

/// How long an aborted viewer session stays blocked.
const SESSION_ABORT_TTL: Duration = Duration::from_secs(300);

/// Default and maximum pause window for abort-all.
const PAUSE_DEFAULT_MS: u64 = 60_000;
const PAUSE_MAX_MS: u64 = 300_000;

/// A single tile render request.
#[derive(Debug, Clone)]
pub struct TileRenderParams {
    pub project: String,
    /// `layer` or `theme`.
    pub mode: String,
    pub name: String,
    pub coord: TileCoord,
    pub output_file: PathBuf,
    pub tile_crs: String,
    /// Explicit bbox override; computed from the preset or Web Mercator
    /// when absent.
    pub bbox: Option<BoundingBox>,
    pub tile_matrix_preset: Option<String>,
    pub sid: Option<String>,
}

impl TileRenderParams {
    fn dedup_key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.project,
            self.mode,
            self.name,
            self.coord.path_key()
        )
    }
}

struct WorkItem {
    key: String,
    request: Value,
    output_file: PathBuf,
}

struct Inflight {
    waiters: Vec<oneshot::Sender<Result<PathBuf, String>>>,
    sid: Option<String>,
    started: bool,
}

pub struct OnDemandPoolInner {
    settings: Arc<Settings>,
    config: Arc<ConfigStore>,
    index: Arc<IndexStore>,
    presets: Arc<Vec<TileMatrixSetPreset>>,
    queue_tx: mpsc::UnboundedSender<WorkItem>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<WorkItem>>,
    inflight: Mutex<HashMap<String, Inflight>>,
    paused_until: Mutex<Option<Instant>>,
    aborted_sessions: Mutex<HashMap<String, Instant>>,
    last_recorded: Mutex<HashMap<String, Instant>>,
}

/// Handle to the on-demand pool; clones share state.
#[derive(Clone)]
pub struct OnDemandPool {
    inner: Arc<OnDemandPoolInner>,
}

impl std::ops::Deref for OnDemandPool {
    type Target = OnDemandPoolInner;

    fn deref(&self) -> &OnDemandPoolInner {
        &self.inner
    }
}

impl OnDemandPool {
    pub fn new(
        settings: Arc<Settings>,
        config: Arc<ConfigStore>,
        index: Arc<IndexStore>,
        presets: Arc<Vec<TileMatrixSetPreset>>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(OnDemandPoolInner {
                settings,
                config,
                index,
                presets,
                queue_tx,
                queue_rx: tokio::sync::Mutex::new(queue_rx),
                inflight: Mutex::new(HashMap::new()),
                paused_until: Mutex::new(None),
                aborted_sessions: Mutex::new(HashMap::new()),
                last_recorded: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Spawn the worker tasks. Called once per process.
    pub fn start(&self) {
        for worker in 0..self.settings.py_worker_pool_size.max(1) {
            let pool = self.clone();
            tokio::spawn(async move {
                pool.worker_loop(worker).await;
            });
        }
    }

    // ------------------------------------------------------------------
    // Public request path
    // ------------------------------------------------------------------

    /// Render one tile, coalescing with any identical in-flight request.
    /// Resolves once the tile file exists and validates.
    pub async fn queue_tile_render(&self, params: TileRenderParams) -> TileResult<PathBuf> {
        if self.is_paused() {
            return Err(TileError::OnDemandPaused);
        }
        if let Some(sid) = &params.sid {
            if self.session_aborted(sid) {
                return Err(TileError::SessionAborted(sid.clone()));
            }
        }

        self.record_request(&params);

        let key = params.dedup_key();
        let (tx, rx) = oneshot::channel();
        let enqueue = {
            let mut inflight = self.inflight.lock().unwrap();
            match inflight.get_mut(&key) {
                Some(entry) => {
                    entry.waiters.push(tx);
                    false
                }
                None => {
                    inflight.insert(
                        key.clone(),
                        Inflight {
                            waiters: vec![tx],
                            sid: params.sid.clone(),
                            started: false,
                        },
                    );
                    true
                }
            }
        };

        if enqueue {
            let request = self.build_request(&params);
            let item = WorkItem {
                key: key.clone(),
                request,
                output_file: params.output_file.clone(),
            };
            if self.queue_tx.send(item).is_err() {
                self.fail_key(&key, "renderer pool unavailable");
            }
        }

        match rx.await {
            Ok(Ok(path)) => Ok(path),
            Ok(Err(message)) => match message.as_str() {
                "aborted" => Err(TileError::Aborted),
                "session_aborted" => Err(TileError::SessionAborted(
                    params.sid.unwrap_or_default(),
                )),
                other if other.starts_with("invalid_tile") => {
                    Err(TileError::InvalidTileOutput(other.to_string()))
                }
                other => Err(TileError::RenderFailed(other.to_string())),
            },
            Err(_) => Err(TileError::Aborted),
        }
    }

    fn build_request(&self, params: &TileRenderParams) -> Value {
        let bbox = params.bbox.unwrap_or_else(|| self.tile_bbox(params));
        let mut request = json!({
            "project_path": projects::resolve_project_file(&self.settings, &params.project)
                .map(|p| p.to_string_lossy().into_owned()),
            "output_file": params.output_file.to_string_lossy(),
            "z": params.coord.z,
            "x": params.coord.x,
            "y": params.coord.y,
            "bbox": bbox.to_array(),
            "tile_crs": params.tile_crs,
        });
        let obj = request.as_object_mut().unwrap();
        obj.insert(params.mode.clone(), json!(params.name));
        if let Some(preset) = &params.tile_matrix_preset {
            obj.insert("tile_matrix_preset".to_string(), json!(preset));
        }
        if let Some(sid) = &params.sid {
            obj.insert("_sid".to_string(), json!(sid));
        }
        request
    }

    /// Tile bbox from the bound preset matrix, or spherical Web Mercator
    /// when the layer has no custom grid.
    fn tile_bbox(&self, params: &TileRenderParams) -> BoundingBox {
        if let Some(preset_id) = &params.tile_matrix_preset {
            if let Some(preset) = self.presets.iter().find(|p| &p.id == preset_id) {
                if let Some(matrix) = preset.matrix_for_zoom(params.coord.z).or_else(|| {
                    preset
                        .matrices
                        .iter()
                        .find(|m| m.source_level() == params.coord.z)
                }) {
                    return preset.tile_bbox(matrix, params.coord.x, params.coord.y);
                }
            }
        }
        web_mercator_tile_bbox(&params.coord)
    }

    /// Throttled recording of on-demand activity in config and index.
    fn record_request(&self, params: &TileRenderParams) {
        let target_key = format!("{}|{}|{}", params.project, params.mode, params.name);
        {
            let mut last = self.last_recorded.lock().unwrap();
            let throttle =
                Duration::from_millis(self.settings.on_demand_record_throttle_ms);
            if let Some(at) = last.get(&target_key) {
                if at.elapsed() < throttle {
                    return;
                }
            }
            last.insert(target_key, Instant::now());
        }

        let mut cfg = self.config.read(&params.project);
        cfg.target_mut(&params.mode, &params.name).last_requested_at = Some(Utc::now());
        if let Err(e) = self.config.write(&params.project, cfg, true) {
            warn!(project = %params.project, error = %e, "On-demand config record failed");
        }

        let result = self.index.upsert_entry(
            &params.project,
            &params.mode,
            &params.name,
            |mut entry| {
                if entry.tile_crs.is_none() {
                    entry.tile_crs = Some(params.tile_crs.clone());
                }
                if entry.tile_format.is_none() {
                    entry.tile_format = Some("png".to_string());
                }
                if entry.tile_matrix_preset.is_none() {
                    entry.tile_matrix_preset = params.tile_matrix_preset.clone();
                }
                if entry.status.is_none() {
                    entry.tile_profile_source = Some("on_demand".to_string());
                }
                entry.cache_exists = Some(true);
                entry
            },
        );
        if let Err(e) = result {
            warn!(project = %params.project, error = %e, "On-demand index record failed");
        }
    }

    // ------------------------------------------------------------------
    // Abort / pause
    // ------------------------------------------------------------------

    fn is_paused(&self) -> bool {
        let mut paused = self.paused_until.lock().unwrap();
        match *paused {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                *paused = None;
                false
            }
            None => false,
        }
    }

    fn session_aborted(&self, sid: &str) -> bool {
        let mut sessions = self.aborted_sessions.lock().unwrap();
        sessions.retain(|_, at| at.elapsed() < SESSION_ABORT_TTL);
        sessions.contains_key(sid)
    }

    /// Mark a viewer session aborted and fail its queued (unstarted) work.
    pub fn abort_session(&self, sid: &str) {
        let sid = sid.trim();
        if sid.is_empty() {
            return;
        }
        self.aborted_sessions
            .lock()
            .unwrap()
            .insert(sid.to_string(), Instant::now());

        let mut dropped: Vec<Inflight> = Vec::new();
        {
            let mut inflight = self.inflight.lock().unwrap();
            let keys: Vec<String> = inflight
                .iter()
                .filter(|(_, entry)| !entry.started && entry.sid.as_deref() == Some(sid))
                .map(|(key, _)| key.clone())
                .collect();
            for key in keys {
                if let Some(entry) = inflight.remove(&key) {
                    dropped.push(entry);
                }
            }
        }
        let count = dropped.len();
        for entry in dropped {
            for waiter in entry.waiters {
                let _ = waiter.send(Err("session_aborted".to_string()));
            }
        }
        if count > 0 {
            info!(sid = %sid, dropped = count, "Dropped queued on-demand renders for session");
        }
    }

    /// Pause the pool and fail everything still queued. Started renders run
    /// to completion; only new and queued work is affected.
    pub fn abort_all(&self, pause_ms: Option<u64>) -> u64 {
        let pause = pause_ms.unwrap_or(PAUSE_DEFAULT_MS).min(PAUSE_MAX_MS);
        *self.paused_until.lock().unwrap() =
            Some(Instant::now() + Duration::from_millis(pause));

        let mut dropped: Vec<Inflight> = Vec::new();
        {
            let mut inflight = self.inflight.lock().unwrap();
            let keys: Vec<String> = inflight
                .iter()
                .filter(|(_, entry)| !entry.started)
                .map(|(key, _)| key.clone())
                .collect();
            for key in keys {
                if let Some(entry) = inflight.remove(&key) {
                    dropped.push(entry);
                }
            }
        }
        for entry in dropped {
            for waiter in entry.waiters {
                let _ = waiter.send(Err("aborted".to_string()));
            }
        }
        info!(pause_ms = pause, "On-demand rendering paused");
        pause
    }

    /// Admin status view.
    pub fn status(&self) -> Value {
        let paused_remaining_ms = self
            .paused_until
            .lock()
            .unwrap()
            .and_then(|until| until.checked_duration_since(Instant::now()))
            .map(|d| d.as_millis() as u64);
        let inflight = self.inflight.lock().unwrap();
        json!({
            "paused": paused_remaining_ms.is_some(),
            "pausedRemainingMs": paused_remaining_ms,
            "inflight": inflight.len(),
            "started": inflight.values().filter(|e| e.started).count(),
            "abortedSessions": self.aborted_sessions.lock().unwrap().len(),
            "workers": self.settings.py_worker_pool_size,
        })
    }

    fn fail_key(&self, key: &str, message: &str) {
        let entry = self.inflight.lock().unwrap().remove(key);
        if let Some(entry) = entry {
            for waiter in entry.waiters {
                let _ = waiter.send(Err(message.to_string()));
            }
        }
    }

    fn fulfill_key(&self, key: &str, path: &PathBuf) {
        let entry = self.inflight.lock().unwrap().remove(key);
        if let Some(entry) = entry {
            for waiter in entry.waiters {
                let _ = waiter.send(Ok(path.clone()));
            }
        }
    }

    // ------------------------------------------------------------------
    // Worker loop
    // ------------------------------------------------------------------

    async fn worker_loop(&self, worker: usize) {
        let mut child: Option<(Child, ChildStdin, BufReader<ChildStdout>)> = None;

        loop {
            let item = {
                let mut rx = self.queue_rx.lock().await;
                rx.recv().await
            };
            let Some(item) = item else {
                return;
            };

            // The entry may have been cancelled while queued.
            {
                let mut inflight = self.inflight.lock().unwrap();
                match inflight.get_mut(&item.key) {
                    Some(entry) => entry.started = true,
                    None => continue,
                }
            }

            if child.is_none() {
                child = self.spawn_worker(worker);
                if child.is_none() {
                    self.fail_key(&item.key, "renderer worker failed to start");
                    continue;
                }
            }

            let (proc, stdin, stdout) = child.as_mut().unwrap();
            match self.render_one(stdin, stdout, &item).await {
                Ok(()) => match tile_file_status(&item.output_file, self.settings.min_tile_bytes)
                {
                    TileFileStatus::Valid => self.fulfill_key(&item.key, &item.output_file),
                    _ => {
                        let _ = std::fs::remove_file(&item.output_file);
                        self.fail_key(&item.key, "invalid_tile: renderer output failed validation");
                    }
                },
                Err(message) => {
                    // A broken pipe means the worker died; replace it.
                    warn!(worker, error = %message, "Tile worker request failed");
                    let _ = proc.start_kill();
                    child = None;
                    let _ = std::fs::remove_file(&item.output_file);
                    self.fail_key(&item.key, &message);
                }
            }
        }
    }

    fn spawn_worker(&self, worker: usize) -> Option<(Child, ChildStdin, BufReader<ChildStdout>)> {
        let mut command = Command::new(&self.settings.python_bin);
        command
            .arg(&self.settings.tile_worker_script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match command.spawn() {
            Ok(mut child) => {
                let stdin = child.stdin.take()?;
                let stdout = BufReader::new(child.stdout.take()?);
                info!(worker, pid = child.id(), "Tile worker started");
                Some((child, stdin, stdout))
            }
            Err(e) => {
                warn!(worker, error = %e, "Failed to spawn tile worker");
                None
            }
        }
    }

    async fn render_one(
        &self,
        stdin: &mut ChildStdin,
        stdout: &mut BufReader<ChildStdout>,
        item: &WorkItem,
    ) -> Result<(), String> {
        if let Some(parent) = item.output_file.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("cannot create tile directory: {}", e))?;
        }

        let mut line = serde_json::to_string(&item.request)
            .map_err(|e| format!("request serialization failed: {}", e))?;
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| format!("worker stdin closed: {}", e))?;
        stdin
            .flush()
            .await
            .map_err(|e| format!("worker stdin flush failed: {}", e))?;

        let mut response_line = String::new();
        let read = tokio::time::timeout(
            Duration::from_millis(self.settings.render_timeout_ms),
            stdout.read_line(&mut response_line),
        )
        .await
        .map_err(|_| "render timed out".to_string())?
        .map_err(|e| format!("worker stdout closed: {}", e))?;
        if read == 0 {
            return Err("worker exited".to_string());
        }

        let response: Value = serde_json::from_str(response_line.trim())
            .map_err(|e| format!("unparseable worker response: {}", e))?;
        match response.get("status").and_then(Value::as_str) {
            Some("ok") => Ok(()),
            Some(_) => Err(response
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("render failed")
                .to_string()),
            None => Err("worker response missing status".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_pool(dir: &std::path::Path) -> OnDemandPool {
        let mut settings = Settings::from_env();
        settings.cache_dir = dir.to_path_buf();
        let settings = Arc::new(settings);
        let layout = storage::CacheLayout::new(dir);
        let config = Arc::new(ConfigStore::new(layout.clone(), settings.clone()));
        let index = Arc::new(IndexStore::new(layout, settings.clone()));
        OnDemandPool::new(settings, config, index, Arc::new(Vec::new()))
    }

    fn params(sid: Option<&str>, z: u32, x: u32, y: u32) -> TileRenderParams {
        TileRenderParams {
            project: "orto".to_string(),
            mode: "layer".to_string(),
            name: "parcels".to_string(),
            coord: TileCoord::new(z, x, y),
            output_file: PathBuf::from("/tmp/tile.png"),
            tile_crs: "EPSG:3857".to_string(),
            bbox: None,
            tile_matrix_preset: None,
            sid: sid.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_paused_pool_fails_fast() {
        let dir = tempdir().unwrap();
        let pool = make_pool(dir.path());
        pool.abort_all(Some(10_000));
        let err = pool.queue_tile_render(params(None, 1, 0, 0)).await;
        assert!(matches!(err, Err(TileError::OnDemandPaused)));
    }

    #[tokio::test]
    async fn test_aborted_session_fails_fast() {
        let dir = tempdir().unwrap();
        let pool = make_pool(dir.path());
        pool.abort_session("sid-1");
        let err = pool.queue_tile_render(params(Some("sid-1"), 1, 0, 0)).await;
        assert!(matches!(err, Err(TileError::SessionAborted(_))));
    }

    #[tokio::test]
    async fn test_coalescing_same_tile() {
        let dir = tempdir().unwrap();
        let pool = make_pool(dir.path());
        // No workers started: requests stay queued, letting us observe the
        // dedup map directly.
        let p1 = params(None, 4, 5, 6);
        let p2 = params(None, 4, 5, 6);
        let pool2 = pool.clone();
        let first = tokio::spawn(async move { pool2.queue_tile_render(p1).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let pool3 = pool.clone();
        let second = tokio::spawn(async move { pool3.queue_tile_render(p2).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(pool.inflight.lock().unwrap().len(), 1);
        let entry_waiters = pool
            .inflight
            .lock()
            .unwrap()
            .values()
            .next()
            .map(|e| e.waiters.len())
            .unwrap();
        assert_eq!(entry_waiters, 2);

        // Abort-all drains both waiters with the same outcome.
        pool.abort_all(None);
        assert!(matches!(first.await.unwrap(), Err(TileError::Aborted)));
        assert!(matches!(second.await.unwrap(), Err(TileError::Aborted)));
    }

    #[tokio::test]
    async fn test_session_abort_drops_only_queued_unstarted() {
        let dir = tempdir().unwrap();
        let pool = make_pool(dir.path());

        let p1 = params(Some("sid-a"), 3, 1, 1);
        let pool2 = pool.clone();
        let waiting = tokio::spawn(async move { pool2.queue_tile_render(p1).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Mark it started, as a worker would.
        for entry in pool.inflight.lock().unwrap().values_mut() {
            entry.started = true;
        }
        pool.abort_session("sid-a");
        // Started entry survives.
        assert_eq!(pool.inflight.lock().unwrap().len(), 1);

        // New requests for that session fail immediately.
        let err = pool.queue_tile_render(params(Some("sid-a"), 3, 2, 2)).await;
        assert!(matches!(err, Err(TileError::SessionAborted(_))));

        pool.fail_key(
            &params(Some("sid-a"), 3, 1, 1).dedup_key(),
            "test teardown",
        );
        let _ = waiting.await;
    }

    #[test]
    fn test_web_mercator_bbox_fallback() {
        let dir = tempdir().unwrap();
        let pool = make_pool(dir.path());
        let bbox = pool.tile_bbox(&params(None, 0, 0, 0));
        assert!((bbox.min_x + 20037508.342789244).abs() < 1e-6);
        assert!((bbox.max_x - 20037508.342789244).abs() < 1e-6);
    }
}
