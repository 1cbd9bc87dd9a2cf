//! Runtime settings parsed from environment variables.

use std::env;
use std::path::PathBuf;

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| v.to_lowercase() == "true" || v == "1")
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_i64(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_path(key: &str, default: &str) -> PathBuf {
    env::var(key).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

/// All environment-tunable knobs of the server.
#[derive(Debug, Clone)]
pub struct Settings {
    // Directories
    pub cache_dir: PathBuf,
    pub data_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub config_dir: PathBuf,
    pub projects_dir: PathBuf,

    /// External base URL used in capability documents; falls back to the
    /// request's Host header when unset.
    pub public_base_url: Option<String>,

    /// Admin guard token; unset disables the guard (development mode).
    pub admin_token: Option<String>,

    // Renderer invocation
    pub python_bin: String,
    pub render_script: String,
    pub tile_worker_script: String,

    // Job manager
    pub job_max: usize,
    pub job_ttl_ms: u64,
    pub abort_grace_ms: u64,
    pub progress_config_interval_ms: u64,
    pub index_flush_interval_ms: u64,

    // Scheduler
    pub schedule_min_lead_ms: i64,
    pub schedule_due_tolerance_ms: i64,
    pub schedule_heartbeat_interval_ms: u64,
    pub schedule_overdue_grace_ms: i64,
    pub project_batch_ttl_ms: u64,
    pub schedule_run_timeout_ms: u64,

    // Tile serving
    pub wmts_tile_cache_max_age_s: u64,
    pub publish_zoom_min_default: u32,
    pub publish_zoom_max_default: u32,
    pub min_tile_bytes: Option<u64>,

    // On-demand rendering
    pub on_demand_record_throttle_ms: u64,
    pub py_worker_pool_size: usize,
    pub render_timeout_ms: u64,
    pub render_tile_retries: u32,

    // Cluster
    pub worker_count: usize,

    // Bootstrap
    pub disable_project_bootstrap: bool,
    pub bootstrap_scheme: String,
    pub bootstrap_tile_crs: String,
    pub bootstrap_zoom_min: u32,
    pub bootstrap_zoom_max: u32,

    /// Port this instance listens on; used for the scheduler's internal
    /// HTTP calls against 127.0.0.1. Filled in after argument parsing.
    pub listen_port: u16,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            cache_dir: parse_path("CACHE_DIR", "cache"),
            data_dir: parse_path("DATA_DIR", "data"),
            logs_dir: parse_path("LOGS_DIR", "logs"),
            config_dir: parse_path("CONFIG_DIR", "config"),
            projects_dir: parse_path("PROJECTS_DIR", "qgisprojects"),

            public_base_url: env::var("PUBLIC_BASE_URL").ok().filter(|s| !s.is_empty()),
            admin_token: env::var("ADMIN_TOKEN").ok().filter(|s| !s.is_empty()),

            python_bin: env::var("PYTHON_BIN").unwrap_or_else(|_| "python3".to_string()),
            render_script: env::var("RENDER_SCRIPT")
                .unwrap_or_else(|_| "generate_cache.py".to_string()),
            tile_worker_script: env::var("TILE_WORKER_SCRIPT")
                .unwrap_or_else(|_| "tile_worker.py".to_string()),

            job_max: parse_usize("JOB_MAX", 4),
            job_ttl_ms: parse_u64("JOB_TTL_MS", 300_000),
            abort_grace_ms: parse_u64("ABORT_GRACE_MS", 1_000),
            progress_config_interval_ms: parse_u64("PROGRESS_CONFIG_INTERVAL_MS", 180_000),
            index_flush_interval_ms: parse_u64("INDEX_FLUSH_INTERVAL_MS", 180_000),

            schedule_min_lead_ms: parse_i64("SCHEDULE_MIN_LEAD_MS", 5_000),
            schedule_due_tolerance_ms: parse_i64("SCHEDULE_DUE_TOLERANCE_MS", 60_000),
            schedule_heartbeat_interval_ms: parse_u64("SCHEDULE_HEARTBEAT_INTERVAL_MS", 60_000),
            schedule_overdue_grace_ms: parse_i64("SCHEDULE_OVERDUE_GRACE_MS", 5_000),
            project_batch_ttl_ms: parse_u64("PROJECT_BATCH_TTL_MS", 900_000),
            schedule_run_timeout_ms: parse_u64("SCHEDULE_RUN_TIMEOUT_MS", 3_600_000),

            wmts_tile_cache_max_age_s: parse_u64("WMTS_TILE_CACHE_MAX_AGE_S", 3_600),
            publish_zoom_min_default: parse_u32("WMTS_DEFAULT_PUBLISH_ZOOM_MIN", 0),
            publish_zoom_max_default: parse_u32("WMTS_DEFAULT_PUBLISH_ZOOM_MAX", 20),
            min_tile_bytes: env::var("MIN_TILE_BYTES").ok().and_then(|v| v.parse().ok()),

            on_demand_record_throttle_ms: parse_u64("ON_DEMAND_RECORD_THROTTLE_MS", 5_000),
            py_worker_pool_size: parse_usize("PY_WORKER_POOL_SIZE", 4),
            render_timeout_ms: parse_u64("RENDER_TIMEOUT_MS", 180_000),
            render_tile_retries: parse_u32("RENDER_TILE_RETRIES", 1),

            worker_count: parse_usize("WORKER_COUNT", num_cpus::get()),

            disable_project_bootstrap: parse_bool("DISABLE_PROJECT_BOOTSTRAP", false),
            bootstrap_scheme: env::var("PROJECT_BOOTSTRAP_SCHEME")
                .unwrap_or_else(|_| "xyz".to_string()),
            bootstrap_tile_crs: env::var("PROJECT_BOOTSTRAP_TILE_CRS")
                .unwrap_or_else(|_| "EPSG:3857".to_string()),
            bootstrap_zoom_min: parse_u32("PROJECT_BOOTSTRAP_ZOOM_MIN", 0),
            bootstrap_zoom_max: parse_u32("PROJECT_BOOTSTRAP_ZOOM_MAX", 5),

            listen_port: 0,
        }
    }

    /// `config/tile-grids/` preset directory.
    pub fn tile_grids_dir(&self) -> PathBuf {
        self.config_dir.join("tile-grids")
    }

    /// `config/service-metadata.json`.
    pub fn service_metadata_path(&self) -> PathBuf {
        self.config_dir.join("service-metadata.json")
    }

    /// `data/job-pids/` pid-record directory.
    pub fn job_pids_dir(&self) -> PathBuf {
        self.data_dir.join("job-pids")
    }

    /// Base URL of this instance for internal self-calls.
    pub fn internal_base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.listen_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::from_env();
        assert_eq!(settings.job_max, 4);
        assert_eq!(settings.job_ttl_ms, 300_000);
        assert_eq!(settings.publish_zoom_max_default, 20);
        assert_eq!(settings.schedule_min_lead_ms, 5_000);
        assert!(settings.worker_count >= 1);
    }
}
