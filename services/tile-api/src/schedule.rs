//! Recache scheduling: recurrence computation, per-project timers, batch
//! runs, and the overdue-catching heartbeat.
//!
//! Each project has at most one armed timer, set to the earliest eligible
//! next-run across all of its layer/theme/project schedules. Execution goes
//! through the public `/generate-cache` HTTP surface against 127.0.0.1 so a
//! scheduled run is indistinguishable from a manual one downstream.

use chrono::{DateTime, Datelike, Duration, Local, LocalResult, NaiveDate, TimeZone, Utc, Weekday};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use storage::{purge_dir, CacheLayout, ProjectLog, TargetKind};
use tile_common::{TileError, TileResult};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config_store::{
    ConfigStore, ProjectConfig, RunHistoryEntry, Schedule, ScheduleMode,
};
use crate::index_store::IndexStore;
use crate::settings::Settings;

/// Window ahead of "now" in which pending items are considered due when a
/// timer fires.
const DUE_WINDOW_MS: i64 = 60_000;

/// Poll cadence while waiting for an HTTP-invoked job.
const JOB_POLL_INTERVAL_MS: u64 = 2_000;

// ============================================================================
// Recurrence computation
// ============================================================================

fn parse_time(time: &str) -> Option<(u32, u32)> {
    let (h, m) = time.split_once(':')?;
    let hour: u32 = h.trim().parse().ok()?;
    let minute: u32 = m.trim().parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

fn parse_weekday(token: &str) -> Option<Weekday> {
    match token {
        "mon" => Some(Weekday::Mon),
        "tue" => Some(Weekday::Tue),
        "wed" => Some(Weekday::Wed),
        "thu" => Some(Weekday::Thu),
        "fri" => Some(Weekday::Fri),
        "sat" => Some(Weekday::Sat),
        "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

/// Resolve a local wall-clock instant to UTC, tolerating DST gaps and folds.
fn local_instant(date: NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    let naive = date.and_hms_opt(hour, minute, 0)?;
    match Local.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(first, _) => Some(first.with_timezone(&Utc)),
        // Spring-forward gap: shift into the following hour.
        LocalResult::None => match Local.from_local_datetime(&(naive + Duration::hours(1))) {
            LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
            LocalResult::Ambiguous(first, _) => Some(first.with_timezone(&Utc)),
            LocalResult::None => None,
        },
    }
}

/// Compute the next run instant for a schedule.
///
/// The anchor is `max(now, lastRunAt)` so a just-completed run cannot
/// immediately re-trigger, and candidates must lie strictly beyond
/// `anchor + min_lead_ms`.
pub fn compute_next_run(
    schedule: &Schedule,
    now: DateTime<Utc>,
    min_lead_ms: i64,
) -> Option<DateTime<Utc>> {
    let anchor = schedule
        .last_run_at
        .map_or(now, |last| if last > now { last } else { now });
    let threshold = anchor + Duration::milliseconds(min_lead_ms);
    let local_anchor = anchor.with_timezone(&Local).date_naive();

    match schedule.mode? {
        ScheduleMode::Weekly => {
            let spec = schedule.weekly.as_ref()?;
            let (hour, minute) = parse_time(&spec.time)?;
            let mut best: Option<DateTime<Utc>> = None;
            for token in &spec.days {
                let Some(weekday) = parse_weekday(token) else {
                    continue;
                };
                for offset in 0..=7i64 {
                    let Some(date) = local_anchor.checked_add_signed(Duration::days(offset))
                    else {
                        continue;
                    };
                    if date.weekday() != weekday {
                        continue;
                    }
                    if let Some(candidate) = local_instant(date, hour, minute) {
                        if candidate > threshold {
                            best = Some(best.map_or(candidate, |b| b.min(candidate)));
                            break;
                        }
                    }
                    // Occurrence already passed this week; the +7 day in a
                    // later offset iteration covers next week.
                }
            }
            best
        }
        ScheduleMode::Monthly => {
            let spec = schedule.monthly.as_ref()?;
            let (hour, minute) = parse_time(&spec.time)?;
            let mut best: Option<DateTime<Utc>> = None;
            let (mut year, mut month) = (local_anchor.year(), local_anchor.month());
            for _ in 0..14 {
                for day in &spec.days {
                    let clamped = (*day).min(days_in_month(year, month)).max(1);
                    let Some(date) = NaiveDate::from_ymd_opt(year, month, clamped) else {
                        continue;
                    };
                    if let Some(candidate) = local_instant(date, hour, minute) {
                        if candidate > threshold {
                            best = Some(best.map_or(candidate, |b| b.min(candidate)));
                        }
                    }
                }
                if month == 12 {
                    year += 1;
                    month = 1;
                } else {
                    month += 1;
                }
            }
            best
        }
        ScheduleMode::Yearly => {
            let spec = schedule.yearly.as_ref()?;
            let mut best: Option<DateTime<Utc>> = None;
            for year_offset in 0..3 {
                let year = local_anchor.year() + year_offset;
                for occurrence in &spec.occurrences {
                    let Some((hour, minute)) = parse_time(&occurrence.time) else {
                        continue;
                    };
                    if !(1..=12).contains(&occurrence.month) {
                        continue;
                    }
                    let clamped = occurrence
                        .day
                        .min(days_in_month(year, occurrence.month))
                        .max(1);
                    let Some(date) = NaiveDate::from_ymd_opt(year, occurrence.month, clamped)
                    else {
                        continue;
                    };
                    if let Some(candidate) = local_instant(date, hour, minute) {
                        if candidate > threshold {
                            best = Some(best.map_or(candidate, |b| b.min(candidate)));
                        }
                    }
                }
            }
            best
        }
    }
}

// ============================================================================
// Schedule items
// ============================================================================

/// One schedulable unit of a project.
#[derive(Debug, Clone)]
pub struct ScheduleItem {
    /// `layer`, `theme`, or `project`.
    pub kind: String,
    pub name: String,
    pub next_ts: DateTime<Utc>,
    pub schedule: Schedule,
}

/// Collect all enabled schedules of a project with their effective next-run
/// instants. A stored `nextRunAt` further than the due tolerance in the
/// future is recomputed rather than trusted.
pub fn derive_project_schedule_items(
    cfg: &ProjectConfig,
    now: DateTime<Utc>,
    min_lead_ms: i64,
    due_tolerance_ms: i64,
) -> Vec<ScheduleItem> {
    let mut items = Vec::new();

    let mut push = |kind: &str, name: &str, schedule: &Schedule| {
        if !schedule.enabled || schedule.mode.is_none() {
            return;
        }
        let effective = match schedule.next_run_at {
            Some(stored) if stored <= now + Duration::milliseconds(due_tolerance_ms) => {
                Some(stored)
            }
            _ => compute_next_run(schedule, now, min_lead_ms),
        };
        if let Some(next_ts) = effective {
            items.push(ScheduleItem {
                kind: kind.to_string(),
                name: name.to_string(),
                next_ts,
                schedule: schedule.clone(),
            });
        }
    };

    for (name, entry) in &cfg.layers {
        push("layer", name, &entry.schedule);
    }
    for (name, entry) in &cfg.themes {
        push("theme", name, &entry.schedule);
    }
    push("project", &cfg.project_id.clone(), &cfg.recache.schedule);

    items.sort_by_key(|item| item.next_ts);
    items
}

// ============================================================================
// Batch runs
// ============================================================================

/// State of a project-wide batch recache.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRun {
    pub id: String,
    pub project: String,
    pub status: String,
    pub reason: Option<String>,
    pub trigger: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub layers: Vec<String>,
    pub total_count: usize,
    pub completed_count: usize,
    pub current_layer: Option<String>,
    pub current_index: Option<usize>,
    pub result: Option<String>,
    pub error: Option<String>,
}

// ============================================================================
// Scheduler
// ============================================================================

struct ProjectTimer {
    target: DateTime<Utc>,
}

pub struct SchedulerInner {
    settings: Arc<Settings>,
    config: Arc<ConfigStore>,
    index: Arc<IndexStore>,
    layout: CacheLayout,
    log: Arc<ProjectLog>,
    timers: Mutex<HashMap<String, ProjectTimer>>,
    batches: Mutex<HashMap<String, BatchRun>>,
    http: reqwest::Client,
}

/// Owns the per-project timers and batch-run state. Clones share state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl std::ops::Deref for Scheduler {
    type Target = SchedulerInner;

    fn deref(&self) -> &SchedulerInner {
        &self.inner
    }
}

impl Scheduler {
    pub fn new(
        settings: Arc<Settings>,
        config: Arc<ConfigStore>,
        index: Arc<IndexStore>,
        layout: CacheLayout,
        log: Arc<ProjectLog>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                settings,
                config,
                index,
                layout,
                log,
                timers: Mutex::new(HashMap::new()),
                batches: Mutex::new(HashMap::new()),
                http: reqwest::Client::new(),
            }),
        }
    }

    /// Spawn the background tasks: the reschedule-channel consumer and the
    /// heartbeat. Called once per worker at startup.
    pub fn start(&self, mut reschedule_rx: UnboundedReceiver<String>) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            while let Some(project) = reschedule_rx.recv().await {
                scheduler.schedule_project_recache(&project);
            }
        });

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(
                scheduler.settings.schedule_heartbeat_interval_ms,
            ));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                scheduler.heartbeat_tick();
            }
        });

        // Arm timers for every project already on disk.
        for project in self.known_projects() {
            self.schedule_project_recache(&project);
        }
    }

    fn known_projects(&self) -> Vec<String> {
        let mut projects = Vec::new();
        let Ok(entries) = std::fs::read_dir(self.layout.root()) else {
            return projects;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() && path.join("project-config.json").exists() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    projects.push(name.to_string());
                }
            }
        }
        projects
    }

    /// (Re)arm the single timer for a project at the earliest eligible
    /// next-run. Removes the timer when no schedule is enabled.
    pub fn schedule_project_recache(&self, project: &str) {
        let now = Utc::now();
        let cfg = self.config.read(project);
        let items = derive_project_schedule_items(
            &cfg,
            now,
            self.settings.schedule_min_lead_ms,
            self.settings.schedule_due_tolerance_ms,
        );

        let Some(earliest) = items.first().map(|item| item.next_ts) else {
            self.timers.lock().unwrap().remove(project);
            return;
        };

        self.timers.lock().unwrap().insert(
            project.to_string(),
            ProjectTimer { target: earliest },
        );

        let delay_ms = (earliest - now).num_milliseconds().max(0) as u64;
        // The platform timer tops out at 2^31-1 ms; a clamped timer fires
        // early, finds nothing due, and re-arms.
        let delay_ms = delay_ms.min(i32::MAX as u64);
        info!(project = %project, next_run = %earliest, delay_ms, "Armed project schedule timer");

        let scheduler = self.clone();
        let project = project.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            scheduler.handle_project_timer(&project, earliest).await;
        });
    }

    /// Timer callback. A stale invocation (the registered target moved) is
    /// a no-op, which makes timers idempotent under re-registration.
    pub async fn handle_project_timer(&self, project: &str, target: DateTime<Utc>) {
        {
            let mut timers = self.timers.lock().unwrap();
            match timers.get(project) {
                Some(timer) if timer.target == target => {
                    timers.remove(project);
                }
                _ => return,
            }
        }

        let now = Utc::now();
        let cfg = self.config.read(project);
        let due: Vec<ScheduleItem> = derive_project_schedule_items(
            &cfg,
            now,
            self.settings.schedule_min_lead_ms,
            self.settings.schedule_due_tolerance_ms,
        )
        .into_iter()
        .filter(|item| item.next_ts <= now + Duration::milliseconds(DUE_WINDOW_MS))
        .collect();

        for item in due {
            if item.kind == "project" {
                match self.run_recache_for_project(project, None, "scheduled-project", "timer", None) {
                    Ok(batch) => self.await_batch(project, &batch.id).await,
                    Err(e) => {
                        warn!(project = %project, error = %e, "Scheduled project batch refused");
                    }
                }
            } else {
                self.run_scheduled_target(project, &item).await;
            }
        }

        self.schedule_project_recache(project);
    }

    /// Heartbeat: force overdue timers whose wakeup was lost (host suspend,
    /// dropped task) and arm projects that have schedules but no timer.
    fn heartbeat_tick(&self) {
        let now = Utc::now();
        let grace = Duration::milliseconds(self.settings.schedule_overdue_grace_ms);

        let overdue: Vec<(String, DateTime<Utc>)> = self
            .timers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, timer)| now >= timer.target - grace)
            .map(|(id, timer)| (id.clone(), timer.target))
            .collect();

        for (project, target) in overdue {
            info!(project = %project, target = %target, "Heartbeat forcing overdue schedule");
            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.handle_project_timer(&project, target).await;
            });
        }

        let registered: Vec<String> = self.timers.lock().unwrap().keys().cloned().collect();
        for project in self.known_projects() {
            if registered.contains(&project) {
                continue;
            }
            let cfg = self.config.read(&project);
            let items = derive_project_schedule_items(
                &cfg,
                now,
                self.settings.schedule_min_lead_ms,
                self.settings.schedule_due_tolerance_ms,
            );
            if !items.is_empty() {
                self.schedule_project_recache(&project);
            }
        }
    }

    // ------------------------------------------------------------------
    // Scheduled execution
    // ------------------------------------------------------------------

    async fn run_scheduled_target(&self, project: &str, item: &ScheduleItem) {
        let cfg = self.config.read(project);
        let entry = cfg.target(&item.kind, &item.name).cloned().unwrap_or_default();

        let mut params = entry
            .last_params
            .clone()
            .and_then(|p| p.as_object().cloned())
            .unwrap_or_else(|| fallback_params(&cfg, &entry, &self.settings));

        let zoom_override =
            item.schedule.zoom_min.is_some() || item.schedule.zoom_max.is_some();
        if let Some(zoom_min) = item.schedule.zoom_min {
            params.insert("zoom_min".to_string(), json!(zoom_min));
        }
        if let Some(zoom_max) = item.schedule.zoom_max {
            params.insert("zoom_max".to_string(), json!(zoom_max));
        }

        // A full scheduled run replaces the cache wholesale; only a zoom
        // override keeps existing levels.
        if !zoom_override {
            let kind = if item.kind == "theme" {
                TargetKind::Theme
            } else {
                TargetKind::Layer
            };
            if let Some(dir) = self.layout.target_dir(project, kind, &item.name) {
                if let Err(e) = purge_dir(&dir) {
                    warn!(project = %project, target = %item.name, error = %e, "Pre-run purge failed");
                }
            }
        }

        params.insert("project".to_string(), json!(project));
        params.remove("layer");
        params.remove("theme");
        params.insert(item.kind.clone(), json!(item.name));
        params.insert(
            "run_reason".to_string(),
            json!(format!("scheduled-{}", item.kind)),
        );
        params.insert("trigger".to_string(), json!("timer"));

        self.log.info(
            project,
            &format!("scheduled {} run starting: {}", item.kind, item.name),
        );

        let outcome = self
            .run_cache_job_via_http(Value::Object(params), self.settings.schedule_run_timeout_ms)
            .await;

        let now = Utc::now();
        let (result, message, job_id) = match outcome {
            Ok((status, message, job_id)) => (status, message, Some(job_id)),
            Err(e) => ("error".to_string(), Some(e), None),
        };

        let mut cfg = self.config.read(project);
        {
            let entry = cfg.target_mut(&item.kind, &item.name);
            entry.schedule.last_run_at = Some(now);
            entry.schedule.last_result = Some(result.clone());
            entry.schedule.last_message = message.clone();
            entry.schedule.history.push(RunHistoryEntry {
                at: Some(now),
                result: Some(result.clone()),
                message: message.clone(),
                job_id,
                run_id: None,
                trigger: Some("timer".to_string()),
            });
        }
        if let Err(e) = self.config.write(project, cfg, true) {
            error!(project = %project, error = %e, "Failed to persist scheduled-run outcome");
        }

        self.log.info(
            project,
            &format!(
                "scheduled {} run finished: {} ({})",
                item.kind, item.name, result
            ),
        );
    }

    /// Run a generate-cache call through the local HTTP surface and poll it
    /// to completion. Returns `(final_status, last_message, job_id)`.
    async fn run_cache_job_via_http(
        &self,
        body: Value,
        timeout_ms: u64,
    ) -> Result<(String, Option<String>, String), String> {
        let base = self.settings.internal_base_url();
        let started = self
            .http
            .post(format!("{}/generate-cache", base))
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("generate-cache request failed: {}", e))?;

        let status = started.status();
        let payload: Value = started
            .json()
            .await
            .map_err(|e| format!("generate-cache response unreadable: {}", e))?;
        if !status.is_success() {
            let code = payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error");
            return Err(format!("generate-cache refused: {}", code));
        }

        let job_id = payload
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| "generate-cache response missing id".to_string())?
            .to_string();

        let deadline =
            tokio::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
        loop {
            tokio::time::sleep(std::time::Duration::from_millis(JOB_POLL_INTERVAL_MS)).await;
            if tokio::time::Instant::now() >= deadline {
                return Err(format!("job {} polling timed out", job_id));
            }

            let polled = match self
                .http
                .get(format!("{}/generate-cache/{}", base, job_id))
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(job = %job_id, error = %e, "Job poll failed, retrying");
                    continue;
                }
            };
            let Ok(job) = polled.json::<Value>().await else {
                continue;
            };
            let status = job
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            if status != "running" && status != "aborting" {
                let message = job
                    .get("lastMessage")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                return Ok((status.to_string(), message, job_id));
            }
        }
    }

    // ------------------------------------------------------------------
    // Batch runs
    // ------------------------------------------------------------------

    /// Start a batch recache over a project's layers. Returns the initial
    /// batch state; the run itself proceeds in a background task.
    pub fn run_recache_for_project(
        &self,
        project: &str,
        explicit_layers: Option<Vec<String>>,
        reason: &str,
        trigger: &str,
        run_id: Option<String>,
    ) -> TileResult<BatchRun> {
        {
            let batches = self.batches.lock().unwrap();
            if let Some(existing) = batches.get(project) {
                if existing.status == "running" || existing.status == "queued" {
                    return Err(TileError::BatchRunning {
                        project: project.to_string(),
                        id: existing.id.clone(),
                    });
                }
            }
        }

        let cfg = self.config.read(project);
        let layers: Vec<String> = match explicit_layers {
            Some(list) if !list.is_empty() => list,
            _ => cfg
                .layers
                .iter()
                .filter(|(_, entry)| {
                    entry.auto_recache != Some(false) && entry.last_params.is_some()
                })
                .map(|(name, _)| name.clone())
                .collect(),
        };
        if layers.is_empty() {
            return Err(TileError::NoLayers(project.to_string()));
        }

        let batch = BatchRun {
            id: run_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            project: project.to_string(),
            status: "running".to_string(),
            reason: Some(reason.to_string()),
            trigger: trigger.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            layers: layers.clone(),
            total_count: layers.len(),
            completed_count: 0,
            current_layer: None,
            current_index: None,
            result: None,
            error: None,
        };
        self.batches
            .lock()
            .unwrap()
            .insert(project.to_string(), batch.clone());

        let scheduler = self.clone();
        let project_owned = project.to_string();
        let batch_id = batch.id.clone();
        let reason_owned = reason.to_string();
        let trigger_owned = trigger.to_string();
        tokio::spawn(async move {
            scheduler
                .execute_batch(&project_owned, &batch_id, layers, &reason_owned, &trigger_owned)
                .await;
        });

        Ok(batch)
    }

    async fn execute_batch(
        &self,
        project: &str,
        batch_id: &str,
        layers: Vec<String>,
        reason: &str,
        trigger: &str,
    ) {
        let total = layers.len();
        let mut failures: Vec<String> = Vec::new();

        for (index, layer) in layers.iter().enumerate() {
            {
                let mut batches = self.batches.lock().unwrap();
                if let Some(batch) = batches.get_mut(project) {
                    batch.current_layer = Some(layer.clone());
                    batch.current_index = Some(index);
                }
            }

            if let Some(dir) = self.layout.target_dir(project, TargetKind::Layer, layer) {
                if let Err(e) = purge_dir(&dir) {
                    warn!(project = %project, layer = %layer, error = %e, "Batch purge failed");
                }
            }
            self.index.clear_cache_fields(project, "layer", layer);

            let cfg = self.config.read(project);
            let entry = cfg.target("layer", layer).cloned().unwrap_or_default();
            let mut params = entry
                .last_params
                .clone()
                .and_then(|p| p.as_object().cloned())
                .unwrap_or_else(|| fallback_params(&cfg, &entry, &self.settings));
            params.insert("project".to_string(), json!(project));
            params.remove("theme");
            params.insert("layer".to_string(), json!(layer));
            params.insert("run_reason".to_string(), json!(reason));
            params.insert("trigger".to_string(), json!(trigger));
            params.insert("run_id".to_string(), json!(batch_id));
            params.insert("batch_index".to_string(), json!(index));
            params.insert("batch_total".to_string(), json!(total));

            match self
                .run_cache_job_via_http(
                    Value::Object(params),
                    self.settings.schedule_run_timeout_ms,
                )
                .await
            {
                Ok((status, _, _)) if status == "completed" => {}
                Ok((status, message, _)) => {
                    failures.push(format!(
                        "{}: {}{}",
                        layer,
                        status,
                        message.map(|m| format!(" ({})", m)).unwrap_or_default()
                    ));
                }
                Err(e) => failures.push(format!("{}: {}", layer, e)),
            }

            let mut batches = self.batches.lock().unwrap();
            if let Some(batch) = batches.get_mut(project) {
                batch.completed_count = index + 1;
            }
        }

        let now = Utc::now();
        let result = if failures.is_empty() { "completed" } else { "error" };
        let error = if failures.is_empty() {
            None
        } else {
            Some(failures.join("; "))
        };

        {
            let mut batches = self.batches.lock().unwrap();
            if let Some(batch) = batches.get_mut(project) {
                batch.status = result.to_string();
                batch.ended_at = Some(now);
                batch.current_layer = None;
                batch.current_index = None;
                batch.result = Some(result.to_string());
                batch.error = error.clone();
            }
        }

        // Aggregate history entry on the project config.
        let mut cfg = self.config.read(project);
        cfg.project_cache.history.push(RunHistoryEntry {
            at: Some(now),
            result: Some(result.to_string()),
            message: error.clone(),
            job_id: None,
            run_id: Some(batch_id.to_string()),
            trigger: Some(trigger.to_string()),
        });
        cfg.project_cache.last_result = Some(json!({
            "at": now,
            "result": result,
            "layers": total,
            "error": error,
        }));
        if let Err(e) = self.config.write(project, cfg, true) {
            error!(project = %project, error = %e, "Failed to persist batch outcome");
        }

        self.log.info(
            project,
            &format!("batch recache {} finished: {}", batch_id, result),
        );

        // Evict terminal batch state after the retention window.
        let scheduler = self.clone();
        let project_owned = project.to_string();
        let batch_owned = batch_id.to_string();
        let ttl = self.settings.project_batch_ttl_ms;
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(ttl)).await;
            let mut batches = scheduler.batches.lock().unwrap();
            if batches
                .get(&project_owned)
                .is_some_and(|b| b.id == batch_owned)
            {
                batches.remove(&project_owned);
            }
        });
    }

    async fn await_batch(&self, project: &str, batch_id: &str) {
        loop {
            tokio::time::sleep(std::time::Duration::from_millis(JOB_POLL_INTERVAL_MS)).await;
            let done = {
                let batches = self.batches.lock().unwrap();
                match batches.get(project) {
                    Some(batch) if batch.id == batch_id => batch.status != "running",
                    _ => true,
                }
            };
            if done {
                return;
            }
        }
    }

    /// Current batch state for a project, if any is retained.
    pub fn batch_for(&self, project: &str) -> Option<BatchRun> {
        self.batches.lock().unwrap().get(project).cloned()
    }

    /// Drop the timer of a deleted project.
    pub fn forget_project(&self, project: &str) {
        self.timers.lock().unwrap().remove(project);
        self.batches.lock().unwrap().remove(project);
    }
}

/// Derive generate-cache parameters for a target that has never been run
/// explicitly: zoom and extent from the project config, scheme and tile CRS
/// from the cache preferences, preset binding from the entry.
pub fn fallback_params(
    cfg: &ProjectConfig,
    entry: &crate::config_store::TargetEntry,
    settings: &Settings,
) -> Map<String, Value> {
    let mut params = Map::new();

    let zoom_min = cfg.zoom.min.unwrap_or(settings.bootstrap_zoom_min);
    let zoom_max = cfg.zoom.max.unwrap_or(settings.bootstrap_zoom_max);
    params.insert("zoom_min".to_string(), json!(zoom_min));
    params.insert("zoom_max".to_string(), json!(zoom_max.max(zoom_min)));

    let scheme = match cfg.cache_preferences.mode.as_str() {
        "auto" => settings.bootstrap_scheme.clone(),
        other => other.to_string(),
    };
    params.insert("scheme".to_string(), json!(scheme));
    params.insert("xyz_mode".to_string(), json!("partial"));

    let tile_crs = cfg
        .cache_preferences
        .tile_crs
        .clone()
        .or_else(|| entry.crs.clone())
        .unwrap_or_else(|| settings.bootstrap_tile_crs.clone());
    params.insert("tile_crs".to_string(), json!(tile_crs));

    if let Some(bbox) = &cfg.extent.bbox {
        params.insert("project_extent".to_string(), json!(bbox));
        if let Some(crs) = &cfg.extent.crs {
            params.insert("extent_crs".to_string(), json!(crs));
        }
    }

    if let Some(preset) = &entry.tile_grid_id {
        params.insert("tile_matrix_preset".to_string(), json!(preset));
    }
    if cfg.cache_preferences.allow_remote {
        params.insert("allow_remote".to_string(), json!(true));
    }
    if cfg.cache_preferences.throttle_ms > 0 {
        params.insert(
            "throttle_ms".to_string(),
            json!(cfg.cache_preferences.throttle_ms),
        );
    }

    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::{MonthlySpec, WeeklySpec, YearlyOccurrence, YearlySpec};
    use chrono::TimeZone;

    fn weekly(days: &[&str], time: &str) -> Schedule {
        Schedule {
            enabled: true,
            mode: Some(ScheduleMode::Weekly),
            weekly: Some(WeeklySpec {
                days: days.iter().map(|s| s.to_string()).collect(),
                time: time.to_string(),
            }),
            ..Default::default()
        }
    }

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Local
            .with_ymd_and_hms(y, mo, d, h, mi, s)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_weekly_next_occurrence() {
        // Sat 2026-01-03 18:00 local; schedule mon 02:00.
        let now = local(2026, 1, 3, 18, 0, 0);
        let next = compute_next_run(&weekly(&["mon"], "02:00"), now, 5_000).unwrap();
        assert_eq!(next, local(2026, 1, 5, 2, 0, 0));
    }

    #[test]
    fn test_weekly_same_day_boundary() {
        // Sunday 23:59:30; schedule sun 23:59 -> already passed, next Sunday.
        let now = local(2026, 1, 4, 23, 59, 30);
        let next = compute_next_run(&weekly(&["sun"], "23:59"), now, 5_000).unwrap();
        assert_eq!(next, local(2026, 1, 11, 23, 59, 0));
    }

    #[test]
    fn test_weekly_earliest_of_multiple_days() {
        // Wed 2026-01-07 12:00; days tue+fri at 06:00 -> Friday is nearer.
        let now = local(2026, 1, 7, 12, 0, 0);
        let next = compute_next_run(&weekly(&["tue", "fri"], "06:00"), now, 5_000).unwrap();
        assert_eq!(next, local(2026, 1, 9, 6, 0, 0));
    }

    #[test]
    fn test_monthly_day31_clamps_in_february() {
        let schedule = Schedule {
            enabled: true,
            mode: Some(ScheduleMode::Monthly),
            monthly: Some(MonthlySpec {
                days: vec![31],
                time: "03:00".to_string(),
            }),
            ..Default::default()
        };
        // 2026-02-01: February 2026 has 28 days.
        let now = local(2026, 2, 1, 0, 0, 0);
        let next = compute_next_run(&schedule, now, 5_000).unwrap();
        assert_eq!(next, local(2026, 2, 28, 3, 0, 0));
    }

    #[test]
    fn test_yearly_occurrences() {
        let schedule = Schedule {
            enabled: true,
            mode: Some(ScheduleMode::Yearly),
            yearly: Some(YearlySpec {
                occurrences: vec![
                    YearlyOccurrence {
                        month: 2,
                        day: 30,
                        time: "01:00".to_string(),
                    },
                    YearlyOccurrence {
                        month: 12,
                        day: 24,
                        time: "01:00".to_string(),
                    },
                ],
            }),
            ..Default::default()
        };
        let now = local(2026, 3, 1, 0, 0, 0);
        // Feb is past for 2026; Dec 24 2026 beats Feb (clamped 28) 2027.
        let next = compute_next_run(&schedule, now, 5_000).unwrap();
        assert_eq!(next, local(2026, 12, 24, 1, 0, 0));
    }

    #[test]
    fn test_anchor_prevents_immediate_retrigger() {
        // lastRunAt right at the scheduled instant: next run is a week out.
        let mut schedule = weekly(&["mon"], "02:00");
        let fired_at = local(2026, 1, 5, 2, 0, 0);
        schedule.last_run_at = Some(fired_at);
        let next = compute_next_run(&schedule, fired_at, 5_000).unwrap();
        assert_eq!(next, local(2026, 1, 12, 2, 0, 0));
    }

    #[test]
    fn test_monotone_in_now() {
        let schedule = weekly(&["mon", "thu"], "04:30");
        let mut previous = None;
        for hour in 0..48 {
            let now = local(2026, 1, 3, 0, 0, 0) + Duration::hours(hour);
            let next = compute_next_run(&schedule, now, 5_000).unwrap();
            if let Some(prev) = previous {
                assert!(next >= prev, "nextRunAt moved backwards");
            }
            previous = Some(next);
        }
    }

    #[test]
    fn test_next_run_strictly_beyond_lead() {
        let schedule = weekly(&["mon"], "02:00");
        for hour in 0..24 * 8 {
            let now = local(2026, 1, 1, 0, 0, 0) + Duration::hours(hour);
            let next = compute_next_run(&schedule, now, 5_000).unwrap();
            assert!(next > now + Duration::milliseconds(5_000));
        }
    }

    #[test]
    fn test_disabled_or_modeless_items_not_derived() {
        let mut cfg = ProjectConfig::defaults_for("p");
        cfg.layers.insert(
            "idle".to_string(),
            crate::config_store::TargetEntry::default(),
        );
        let mut scheduled = crate::config_store::TargetEntry::default();
        scheduled.schedule = weekly(&["mon"], "02:00");
        cfg.layers.insert("active".to_string(), scheduled);

        let items =
            derive_project_schedule_items(&cfg, local(2026, 1, 3, 12, 0, 0), 5_000, 60_000);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "active");
        assert_eq!(items[0].kind, "layer");
    }

    #[test]
    fn test_derive_trusts_near_due_stored_next_run() {
        let mut cfg = ProjectConfig::defaults_for("p");
        let now = local(2026, 1, 3, 12, 0, 0);
        let mut entry = crate::config_store::TargetEntry::default();
        entry.schedule = weekly(&["mon"], "02:00");
        // Stored instant 30s out: inside the tolerance, must be kept as-is.
        entry.schedule.next_run_at = Some(now + Duration::seconds(30));
        cfg.layers.insert("parcels".to_string(), entry);

        let items = derive_project_schedule_items(&cfg, now, 5_000, 60_000);
        assert_eq!(items[0].next_ts, now + Duration::seconds(30));
    }

    #[test]
    fn test_fallback_params_from_config() {
        let mut cfg = ProjectConfig::defaults_for("p");
        cfg.zoom.min = Some(2);
        cfg.zoom.max = Some(9);
        cfg.extent.bbox = Some(vec![0.0, 0.0, 100.0, 100.0]);
        cfg.extent.crs = Some("EPSG:3006".to_string());
        cfg.cache_preferences.tile_crs = Some("EPSG:3006".to_string());
        cfg.cache_preferences.mode = "custom".to_string();
        cfg.cache_preferences.allow_remote = true;

        let mut entry = crate::config_store::TargetEntry::default();
        entry.tile_grid_id = Some("sweref99tm".to_string());

        let settings = Settings::from_env();
        let params = fallback_params(&cfg, &entry, &settings);
        assert_eq!(params["zoom_min"], 2);
        assert_eq!(params["zoom_max"], 9);
        assert_eq!(params["scheme"], "custom");
        assert_eq!(params["tile_crs"], "EPSG:3006");
        assert_eq!(params["tile_matrix_preset"], "sweref99tm");
        assert_eq!(params["allow_remote"], true);
        assert_eq!(params["extent_crs"], "EPSG:3006");
    }
}
