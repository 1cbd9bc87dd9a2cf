//! Per-project configuration: load, merge, patch, persist.
//!
//! Configs live at `cache/<id>/project-config.json` and are always read as
//! defaults deep-merged with the on-disk document, so older files missing
//! newer sections stay loadable. Writes are atomic with `.bak` retention.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use storage::{read_json_with_backup, write_atomic_with_backup, CacheLayout};
use tile_common::{TileError, TileResult};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::schedule::compute_next_run;
use crate::settings::Settings;

/// Maximum retained history entries per schedule / batch section.
pub const HISTORY_LIMIT: usize = 25;

const WEEKDAYS: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

// ============================================================================
// Model
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtentInfo {
    pub bbox: Option<Vec<f64>>,
    pub crs: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ZoomInfo {
    pub min: Option<u32>,
    pub max: Option<u32>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CachePreferences {
    /// One of `xyz`, `wmts`, `custom`, `auto`.
    pub mode: String,
    pub tile_crs: Option<String>,
    pub allow_remote: bool,
    pub throttle_ms: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for CachePreferences {
    fn default() -> Self {
        Self {
            mode: "auto".to_string(),
            tile_crs: None,
            allow_remote: false,
            throttle_ms: 0,
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
    Weekly,
    Monthly,
    Yearly,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct WeeklySpec {
    pub days: Vec<String>,
    pub time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct MonthlySpec {
    pub days: Vec<u32>,
    pub time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct YearlyOccurrence {
    pub month: u32,
    pub day: u32,
    pub time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct YearlySpec {
    pub occurrences: Vec<YearlyOccurrence>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RunHistoryEntry {
    pub at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub message: Option<String>,
    pub job_id: Option<String>,
    pub run_id: Option<String>,
    pub trigger: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Schedule {
    pub enabled: bool,
    pub mode: Option<ScheduleMode>,
    pub weekly: Option<WeeklySpec>,
    pub monthly: Option<MonthlySpec>,
    pub yearly: Option<YearlySpec>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
    pub last_message: Option<String>,
    pub history: Vec<RunHistoryEntry>,
    pub zoom_min: Option<u32>,
    pub zoom_max: Option<u32>,
}

/// A layer or theme entry inside a project config.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetEntry {
    /// Body of the last explicit generate-cache request for this target.
    pub last_params: Option<Value>,
    pub auto_recache: Option<bool>,
    pub last_requested_at: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
    pub last_message: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub progress: Option<Value>,
    pub schedule: Schedule,
    pub wfs_editable: Option<bool>,
    pub tile_grid_id: Option<String>,
    pub crs: Option<String>,
    pub extent: Option<Vec<f64>>,
    pub resolutions: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RecacheSection {
    pub schedule: Schedule,
    pub history: Vec<RunHistoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectCacheSection {
    pub history: Vec<RunHistoryEntry>,
    pub last_result: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectConfig {
    pub project_id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub extent: ExtentInfo,
    pub extent_wgs84: ExtentInfo,
    pub zoom: ZoomInfo,
    pub cache_preferences: CachePreferences,
    pub layers: BTreeMap<String, TargetEntry>,
    pub themes: BTreeMap<String, TargetEntry>,
    pub recache: RecacheSection,
    pub project_cache: ProjectCacheSection,
}

impl ProjectConfig {
    pub fn defaults_for(id: &str) -> Self {
        let now = Utc::now();
        Self {
            project_id: id.to_string(),
            created_at: Some(now),
            updated_at: Some(now),
            extent_wgs84: ExtentInfo {
                crs: Some("EPSG:4326".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn target(&self, mode: &str, name: &str) -> Option<&TargetEntry> {
        match mode {
            "theme" => self.themes.get(name),
            _ => self.layers.get(name),
        }
    }

    pub fn target_mut(&mut self, mode: &str, name: &str) -> &mut TargetEntry {
        match mode {
            "theme" => self.themes.entry(name.to_string()).or_default(),
            _ => self.layers.entry(name.to_string()).or_default(),
        }
    }
}

// ============================================================================
// Deep merge
// ============================================================================

/// Merge `patch` into `base`: objects merge recursively, everything else
/// (arrays included) replaces wholesale.
pub fn deep_merge(base: Value, patch: Value) -> Value {
    match (base, patch) {
        (Value::Object(mut a), Value::Object(b)) => {
            for (key, incoming) in b {
                let merged = match a.remove(&key) {
                    Some(existing) => deep_merge(existing, incoming),
                    None => incoming,
                };
                a.insert(key, merged);
            }
            Value::Object(a)
        }
        (_, patch) => patch,
    }
}

fn trim_history(history: &mut Vec<RunHistoryEntry>) {
    if history.len() > HISTORY_LIMIT {
        let excess = history.len() - HISTORY_LIMIT;
        history.drain(0..excess);
    }
}

/// Bound histories and recompute `nextRunAt` for every schedule in the
/// config, based on its current enabled state and mode.
pub fn finalize_schedules(cfg: &mut ProjectConfig, now: DateTime<Utc>, min_lead_ms: i64) {
    fn finalize(schedule: &mut Schedule, now: DateTime<Utc>, min_lead_ms: i64) {
        trim_history(&mut schedule.history);
        schedule.next_run_at = if schedule.enabled && schedule.mode.is_some() {
            compute_next_run(schedule, now, min_lead_ms)
        } else {
            None
        };
    }

    finalize(&mut cfg.recache.schedule, now, min_lead_ms);
    trim_history(&mut cfg.recache.history);
    trim_history(&mut cfg.project_cache.history);
    for entry in cfg.layers.values_mut().chain(cfg.themes.values_mut()) {
        finalize(&mut entry.schedule, now, min_lead_ms);
    }
}

// ============================================================================
// Store
// ============================================================================

/// Caching config service over the atomic JSON store.
pub struct ConfigStore {
    layout: CacheLayout,
    settings: Arc<Settings>,
    cache: Mutex<HashMap<String, ProjectConfig>>,
    reschedule_tx: Mutex<Option<UnboundedSender<String>>>,
}

impl ConfigStore {
    pub fn new(layout: CacheLayout, settings: Arc<Settings>) -> Self {
        Self {
            layout,
            settings,
            cache: Mutex::new(HashMap::new()),
            reschedule_tx: Mutex::new(None),
        }
    }

    /// Wire the scheduler's reschedule channel; config writes push the
    /// project id so the scheduler re-derives its timer.
    pub fn set_reschedule_channel(&self, tx: UnboundedSender<String>) {
        *self.reschedule_tx.lock().unwrap() = Some(tx);
    }

    /// Read a merged config: defaults overlaid with the on-disk file.
    /// Cached per id.
    pub fn read(&self, id: &str) -> ProjectConfig {
        if let Some(cached) = self.cache.lock().unwrap().get(id) {
            return cached.clone();
        }

        let defaults = ProjectConfig::defaults_for(id);
        let Some(path) = self.layout.project_config_path(id) else {
            return defaults;
        };

        let cfg = match read_json_with_backup::<Value>(&path) {
            Some(disk) => {
                let merged = deep_merge(
                    serde_json::to_value(&defaults).unwrap_or(Value::Null),
                    disk,
                );
                match serde_json::from_value::<ProjectConfig>(merged) {
                    Ok(mut cfg) => {
                        cfg.project_id = defaults.project_id.clone();
                        cfg
                    }
                    Err(e) => {
                        warn!(project = %id, error = %e, "Unusable project config, using defaults");
                        defaults
                    }
                }
            }
            None => defaults,
        };

        self.cache.lock().unwrap().insert(id.to_string(), cfg.clone());
        cfg
    }

    /// Persist a config: trim histories, finalize schedules, write
    /// atomically, refresh the cache, and (unless suppressed) ask the
    /// scheduler to re-register the project timer.
    pub fn write(&self, id: &str, mut cfg: ProjectConfig, skip_reschedule: bool) -> TileResult<()> {
        let path = self
            .layout
            .project_config_path(id)
            .ok_or_else(|| TileError::ProjectNotFound(id.to_string()))?;

        let now = Utc::now();
        // createdAt survives rewrites.
        if cfg.created_at.is_none() {
            cfg.created_at = self
                .cache
                .lock()
                .unwrap()
                .get(id)
                .and_then(|prev| prev.created_at)
                .or(Some(now));
        }
        cfg.updated_at = Some(now);
        cfg.project_id = id.to_string();
        finalize_schedules(&mut cfg, now, self.settings.schedule_min_lead_ms);

        write_atomic_with_backup(&path, &cfg)
            .map_err(|e| TileError::WriteFailed(format!("{}: {}", path.display(), e)))?;

        self.cache.lock().unwrap().insert(id.to_string(), cfg);

        if !skip_reschedule {
            if let Some(tx) = self.reschedule_tx.lock().unwrap().as_ref() {
                let _ = tx.send(id.to_string());
            }
        }
        Ok(())
    }

    /// Apply a JSON patch: read, merge, write.
    pub fn update(&self, id: &str, patch: Value) -> TileResult<ProjectConfig> {
        self.update_inner(id, patch, false)
    }

    /// Like [`update`](Self::update) but without re-registering the timer;
    /// used by the scheduler itself and by progress recording.
    pub fn update_without_reschedule(&self, id: &str, patch: Value) -> TileResult<ProjectConfig> {
        self.update_inner(id, patch, true)
    }

    fn update_inner(
        &self,
        id: &str,
        patch: Value,
        skip_reschedule: bool,
    ) -> TileResult<ProjectConfig> {
        let current = self.read(id);
        let created_at = current.created_at;
        let merged = deep_merge(serde_json::to_value(&current)?, patch);
        let mut cfg: ProjectConfig = serde_json::from_value(merged)?;
        cfg.created_at = created_at;
        self.write(id, cfg.clone(), skip_reschedule)?;
        Ok(self.read(id))
    }

    /// Drop a project from the in-memory cache (project deletion).
    pub fn evict(&self, id: &str) {
        self.cache.lock().unwrap().remove(id);
        info!(project = %id, "Evicted project config from cache");
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }
}

// ============================================================================
// External PATCH validation
// ============================================================================

fn valid_time(value: &Value) -> Option<String> {
    let s = value.as_str()?.trim();
    let (h, m) = s.split_once(':')?;
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some(format!("{:02}:{:02}", hour, minute))
}

fn sanitize_weekly(value: &Value) -> Option<Value> {
    let obj = value.as_object()?;
    let mut days: Vec<String> = Vec::new();
    for day in obj.get("days")?.as_array()? {
        let Some(raw) = day.as_str() else { continue };
        let token: String = raw.trim().to_lowercase().chars().take(3).collect();
        if WEEKDAYS.contains(&token.as_str()) && !days.contains(&token) {
            days.push(token);
        }
    }
    let time = valid_time(obj.get("time")?)?;
    if days.is_empty() {
        return None;
    }
    Some(json!({ "days": days, "time": time }))
}

fn sanitize_monthly(value: &Value) -> Option<Value> {
    let obj = value.as_object()?;
    let mut days: Vec<u64> = Vec::new();
    for day in obj.get("days")?.as_array()? {
        let Some(n) = day.as_u64() else { continue };
        if (1..=31).contains(&n) && !days.contains(&n) {
            days.push(n);
        }
    }
    let time = valid_time(obj.get("time")?)?;
    if days.is_empty() {
        return None;
    }
    Some(json!({ "days": days, "time": time }))
}

fn sanitize_yearly(value: &Value) -> Option<Value> {
    let obj = value.as_object()?;
    let mut occurrences = Vec::new();
    for occ in obj.get("occurrences")?.as_array()?.iter().take(3) {
        let Some(o) = occ.as_object() else { continue };
        let Some(month) = o.get("month").and_then(Value::as_u64) else {
            continue;
        };
        let Some(day) = o.get("day").and_then(Value::as_u64) else {
            continue;
        };
        let Some(time) = o.get("time").and_then(valid_time) else {
            continue;
        };
        if (1..=12).contains(&month) && (1..=31).contains(&day) {
            occurrences.push(json!({ "month": month, "day": day, "time": time }));
        }
    }
    if occurrences.is_empty() {
        return None;
    }
    Some(json!({ "occurrences": occurrences }))
}

/// Validate and coerce one schedule object from a PATCH body. Unknown
/// modes and malformed specs are dropped silently.
fn sanitize_schedule(value: &Value) -> Option<Value> {
    let obj = value.as_object()?;
    let mut out = Map::new();

    if let Some(enabled) = obj.get("enabled").and_then(Value::as_bool) {
        out.insert("enabled".to_string(), Value::Bool(enabled));
    }

    match obj.get("mode").and_then(Value::as_str) {
        Some(mode @ ("weekly" | "monthly" | "yearly")) => {
            let spec = match mode {
                "weekly" => obj.get("weekly").and_then(sanitize_weekly),
                "monthly" => obj.get("monthly").and_then(sanitize_monthly),
                _ => obj.get("yearly").and_then(sanitize_yearly),
            };
            if let Some(spec) = spec {
                out.insert("mode".to_string(), Value::String(mode.to_string()));
                out.insert(mode.to_string(), spec);
            }
        }
        Some(_) => {} // unknown mode: rejected silently
        None => {
            if obj.get("mode").is_some_and(Value::is_null) {
                out.insert("mode".to_string(), Value::Null);
            }
        }
    }

    for zoom_key in ["zoomMin", "zoomMax"] {
        match obj.get(zoom_key) {
            Some(Value::Null) => {
                out.insert(zoom_key.to_string(), Value::Null);
            }
            Some(v) => {
                if let Some(n) = v.as_u64() {
                    out.insert(zoom_key.to_string(), json!(n));
                }
            }
            None => {}
        }
    }

    if out.is_empty() {
        None
    } else {
        Some(Value::Object(out))
    }
}

fn sanitize_extent(value: &Value) -> Option<Value> {
    let obj = value.as_object()?;
    let mut out = Map::new();
    match obj.get("bbox") {
        Some(Value::Null) => {
            out.insert("bbox".to_string(), Value::Null);
        }
        Some(Value::Array(arr)) if arr.len() == 4 && arr.iter().all(Value::is_number) => {
            out.insert("bbox".to_string(), Value::Array(arr.clone()));
        }
        _ => {}
    }
    if let Some(crs) = obj.get("crs").and_then(Value::as_str) {
        out.insert("crs".to_string(), json!(crs));
    }
    if out.is_empty() {
        None
    } else {
        out.insert("updatedAt".to_string(), json!(Utc::now()));
        Some(Value::Object(out))
    }
}

fn sanitize_targets(value: &Value) -> Option<Value> {
    let obj = value.as_object()?;
    let mut out = Map::new();
    for (name, body) in obj {
        let Some(target) = body.as_object() else {
            continue;
        };
        let mut entry = Map::new();
        if let Some(auto) = target.get("autoRecache").and_then(Value::as_bool) {
            entry.insert("autoRecache".to_string(), Value::Bool(auto));
        }
        if let Some(schedule) = target.get("schedule").and_then(sanitize_schedule) {
            entry.insert("schedule".to_string(), schedule);
        }
        if let Some(editable) = target.get("wfsEditable").and_then(Value::as_bool) {
            entry.insert("wfsEditable".to_string(), Value::Bool(editable));
        }
        if !entry.is_empty() {
            out.insert(name.clone(), Value::Object(entry));
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(Value::Object(out))
    }
}

/// Validate and coerce an external PATCH body into an acceptable config
/// patch. Unknown fields are dropped.
pub fn build_project_config_patch(body: &Value) -> Value {
    let mut patch = Map::new();
    let Some(obj) = body.as_object() else {
        return Value::Object(patch);
    };

    if let Some(extent) = obj.get("extent").and_then(sanitize_extent) {
        patch.insert("extent".to_string(), extent);
    }
    if let Some(extent) = obj.get("extentWgs84").and_then(sanitize_extent) {
        patch.insert("extentWgs84".to_string(), extent);
    }

    if let Some(zoom) = obj.get("zoom").and_then(Value::as_object) {
        let mut z = Map::new();
        for key in ["min", "max"] {
            match zoom.get(key) {
                Some(Value::Null) => {
                    z.insert(key.to_string(), Value::Null);
                }
                Some(v) => {
                    if let Some(n) = v.as_u64() {
                        z.insert(key.to_string(), json!(n));
                    }
                }
                None => {}
            }
        }
        if !z.is_empty() {
            z.insert("updatedAt".to_string(), json!(Utc::now()));
            patch.insert("zoom".to_string(), Value::Object(z));
        }
    }

    if let Some(prefs) = obj.get("cachePreferences").and_then(Value::as_object) {
        let mut p = Map::new();
        if let Some(mode @ ("xyz" | "wmts" | "custom" | "auto")) =
            prefs.get("mode").and_then(Value::as_str)
        {
            p.insert("mode".to_string(), json!(mode));
        }
        if let Some(crs) = prefs.get("tileCrs").and_then(Value::as_str) {
            p.insert("tileCrs".to_string(), json!(crs));
        }
        if let Some(remote) = prefs.get("allowRemote").and_then(Value::as_bool) {
            p.insert("allowRemote".to_string(), Value::Bool(remote));
        }
        if let Some(throttle) = prefs.get("throttleMs").and_then(Value::as_u64) {
            p.insert("throttleMs".to_string(), json!(throttle));
        }
        if !p.is_empty() {
            p.insert("updatedAt".to_string(), json!(Utc::now()));
            patch.insert("cachePreferences".to_string(), Value::Object(p));
        }
    }

    if let Some(layers) = obj.get("layers").and_then(sanitize_targets) {
        patch.insert("layers".to_string(), layers);
    }
    if let Some(themes) = obj.get("themes").and_then(sanitize_targets) {
        patch.insert("themes".to_string(), themes);
    }

    if let Some(recache) = obj.get("recache").and_then(Value::as_object) {
        if let Some(schedule) = recache.get("schedule").and_then(sanitize_schedule) {
            patch.insert("recache".to_string(), json!({ "schedule": schedule }));
        }
    }

    Value::Object(patch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_store(dir: &std::path::Path) -> ConfigStore {
        let mut settings = Settings::from_env();
        settings.cache_dir = dir.to_path_buf();
        ConfigStore::new(CacheLayout::new(dir), Arc::new(settings))
    }

    #[test]
    fn test_deep_merge_objects_and_arrays() {
        let base = json!({"a": {"x": 1, "y": 2}, "list": [1, 2, 3]});
        let patch = json!({"a": {"y": 9}, "list": [4]});
        let merged = deep_merge(base, patch);
        assert_eq!(merged, json!({"a": {"x": 1, "y": 9}, "list": [4]}));
    }

    #[test]
    fn test_deep_merge_idempotent() {
        let defaults = serde_json::to_value(ProjectConfig::defaults_for("p")).unwrap();
        let patch = json!({"zoom": {"min": 2, "max": 9}});
        let once = deep_merge(defaults.clone(), patch.clone());
        let twice = deep_merge(defaults, deep_merge(once.clone(), patch));
        assert_eq!(once["zoom"], twice["zoom"]);
    }

    #[test]
    fn test_read_missing_returns_defaults() {
        let dir = tempdir().unwrap();
        let cfg = make_store(dir.path()).read("fresh");
        assert_eq!(cfg.project_id, "fresh");
        assert!(cfg.layers.is_empty());
        assert_eq!(cfg.cache_preferences.mode, "auto");
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());

        let mut cfg = store.read("orto");
        cfg.zoom.min = Some(2);
        cfg.zoom.max = Some(7);
        store.write("orto", cfg, true).unwrap();

        // Re-read through a fresh store to force the disk path.
        let fresh = make_store(dir.path());
        let back = fresh.read("orto");
        assert_eq!(back.zoom.min, Some(2));
        assert_eq!(back.zoom.max, Some(7));
    }

    #[test]
    fn test_write_is_read_idempotent() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        let mut cfg = store.read("orto");
        cfg.zoom.min = Some(1);
        store.write("orto", cfg, true).unwrap();

        let before = store.read("orto");
        store.write("orto", before.clone(), true).unwrap();
        let after = store.read("orto");
        assert_eq!(before.zoom, after.zoom);
        assert_eq!(before.created_at, after.created_at);
        assert_eq!(before.layers, after.layers);
    }

    #[test]
    fn test_update_preserves_created_at() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        let first = store.update("orto", json!({"zoom": {"min": 1}})).unwrap();
        let created = first.created_at.unwrap();

        let second = store
            .update("orto", json!({"zoom": {"max": 8}}))
            .unwrap();
        assert_eq!(second.created_at.unwrap(), created);
        assert_eq!(second.zoom.min, Some(1));
        assert_eq!(second.zoom.max, Some(8));
    }

    #[test]
    fn test_history_trimmed_on_write() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        let mut cfg = store.read("orto");
        for i in 0..40 {
            cfg.recache.history.push(RunHistoryEntry {
                message: Some(format!("run {}", i)),
                ..Default::default()
            });
        }
        store.write("orto", cfg, true).unwrap();
        let back = store.read("orto");
        assert_eq!(back.recache.history.len(), HISTORY_LIMIT);
        assert_eq!(back.recache.history[0].message.as_deref(), Some("run 15"));
    }

    #[test]
    fn test_patch_builder_whitelists() {
        let body = json!({
            "zoom": {"min": 3, "max": 9},
            "rogue": {"x": 1},
            "cachePreferences": {"mode": "banana", "allowRemote": true},
            "layers": {
                "parcels": {
                    "autoRecache": false,
                    "lastParams": {"evil": true},
                    "schedule": {
                        "enabled": true,
                        "mode": "weekly",
                        "weekly": {"days": ["Monday", "MON", "tue", "bogus"], "time": "02:00"}
                    }
                }
            }
        });

        let patch = build_project_config_patch(&body);
        assert!(patch.get("rogue").is_none());
        assert_eq!(patch["zoom"]["min"], 3);
        // invalid mode dropped, allowRemote kept
        assert!(patch["cachePreferences"].get("mode").is_none());
        assert_eq!(patch["cachePreferences"]["allowRemote"], true);
        // lastParams is not patchable from outside
        assert!(patch["layers"]["parcels"].get("lastParams").is_none());
        let days = patch["layers"]["parcels"]["schedule"]["weekly"]["days"]
            .as_array()
            .unwrap();
        assert_eq!(days.len(), 2); // mon + tue, deduped, lowercased, trimmed
        assert_eq!(days[0], "mon");
    }

    #[test]
    fn test_patch_builder_rejects_bad_schedule_mode() {
        let body = json!({
            "recache": {"schedule": {"enabled": true, "mode": "daily"}}
        });
        let patch = build_project_config_patch(&body);
        // mode rejected silently; enabled still recognized
        assert_eq!(patch["recache"]["schedule"]["enabled"], true);
        assert!(patch["recache"]["schedule"].get("mode").is_none());
    }

    #[test]
    fn test_patch_builder_caps_yearly_occurrences() {
        let body = json!({
            "recache": {"schedule": {"mode": "yearly", "yearly": {"occurrences": [
                {"month": 1, "day": 1, "time": "00:30"},
                {"month": 4, "day": 15, "time": "01:00"},
                {"month": 7, "day": 31, "time": "02:00"},
                {"month": 10, "day": 10, "time": "03:00"}
            ]}}}
        });
        let patch = build_project_config_patch(&body);
        let occurrences = patch["recache"]["schedule"]["yearly"]["occurrences"]
            .as_array()
            .unwrap();
        assert_eq!(occurrences.len(), 3);
    }
}
