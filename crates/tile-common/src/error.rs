//! Error types for the tile cache server.

use thiserror::Error;

/// Result type alias using TileError.
pub type TileResult<T> = Result<T, TileError>;

/// Primary error type for cache and OGC operations.
#[derive(Debug, Error)]
pub enum TileError {
    // === Request argument errors ===
    #[error("Exactly one of 'layer' or 'theme' is required")]
    TargetRequired,

    #[error("Only one of 'layer' or 'theme' may be given")]
    TooManyTargets,

    #[error("Invalid target name: {0}")]
    InvalidTargetName(String),

    #[error("Project id required")]
    ProjectIdRequired,

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("No layers eligible for recache in project {0}")]
    NoLayers(String),

    // === Job lifecycle errors ===
    #[error("A job is already running for {key}")]
    JobAlreadyRunning { key: String, id: String },

    #[error("Server busy: {running} of {max} job slots in use")]
    ServerBusy { running: usize, max: usize },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {0} is still running")]
    JobRunning(String),

    #[error("Failed to abort job {id}: pids {pids:?} still alive")]
    AbortFailed { id: String, pids: Vec<u32> },

    #[error("Timed out waiting for jobs of project {0} to abort")]
    JobAbortFailed(String),

    #[error("A batch run is already active for {project}: {id}")]
    BatchRunning { project: String, id: String },

    // === Auth errors (external provider) ===
    #[error("Authentication required")]
    AuthRequired,

    // === I/O failures ===
    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("Cache delete failed: {0}")]
    CacheDeleteFailed(String),

    #[error("Invalid cache path: {0}")]
    InvalidCachePath(String),

    // === OGC document errors ===
    #[error("WMTS capabilities failed: {0}")]
    WmtsCapabilitiesFailed(String),

    #[error("WMS capabilities failed: {0}")]
    WmsCapabilitiesFailed(String),

    #[error("WMS GetMap failed: {0}")]
    WmsGetMapFailed(String),

    #[error("Tile not found")]
    TileNotFound,

    // === On-demand rendering ===
    #[error("On-demand rendering is paused")]
    OnDemandPaused,

    #[error("Viewer session aborted: {0}")]
    SessionAborted(String),

    #[error("Render aborted")]
    Aborted,

    #[error("Renderer produced an invalid tile: {0}")]
    InvalidTileOutput(String),

    #[error("Render failed: {0}")]
    RenderFailed(String),

    // === Infrastructure ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TileError {
    /// Stable error-code string used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            TileError::TargetRequired => "target_required",
            TileError::TooManyTargets => "too_many_targets",
            TileError::InvalidTargetName(_) => "invalid_target_name",
            TileError::ProjectIdRequired => "project_id_required",
            TileError::ProjectNotFound(_) => "project_not_found",
            TileError::NoLayers(_) => "no_layers",
            TileError::JobAlreadyRunning { .. } => "job_already_running",
            TileError::ServerBusy { .. } => "server_busy",
            TileError::JobNotFound(_) => "job_not_found",
            TileError::JobRunning(_) => "job_running",
            TileError::AbortFailed { .. } => "abort_failed",
            TileError::JobAbortFailed(_) => "job_abort_failed",
            TileError::BatchRunning { .. } => "batch_running",
            TileError::AuthRequired => "auth_required",
            TileError::WriteFailed(_) => "write_failed",
            TileError::DeleteFailed(_) => "delete_failed",
            TileError::CacheDeleteFailed(_) => "cache_delete_failed",
            TileError::InvalidCachePath(_) => "invalid_cache_path",
            TileError::WmtsCapabilitiesFailed(_) => "wmts_capabilities_failed",
            TileError::WmsCapabilitiesFailed(_) => "wms_capabilities_failed",
            TileError::WmsGetMapFailed(_) => "wms_getmap_failed",
            TileError::TileNotFound => "tile_not_found",
            TileError::OnDemandPaused => "on_demand_paused",
            TileError::SessionAborted(_) => "session_aborted",
            TileError::Aborted => "aborted",
            TileError::InvalidTileOutput(_) => "invalid_tile_output",
            TileError::RenderFailed(_) => "render_failed",
            TileError::Internal(_) => "internal_error",
        }
    }

    /// HTTP status code for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            TileError::TargetRequired
            | TileError::TooManyTargets
            | TileError::InvalidTargetName(_)
            | TileError::ProjectIdRequired
            | TileError::NoLayers(_) => 400,

            TileError::AuthRequired => 401,

            TileError::ProjectNotFound(_)
            | TileError::JobNotFound(_)
            | TileError::TileNotFound => 404,

            TileError::JobAlreadyRunning { .. }
            | TileError::JobRunning(_)
            | TileError::BatchRunning { .. } => 409,

            TileError::ServerBusy { .. } => 429,

            _ => 500,
        }
    }
}

impl From<std::io::Error> for TileError {
    fn from(err: std::io::Error) -> Self {
        TileError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for TileError {
    fn from(err: serde_json::Error) -> Self {
        TileError::Internal(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_statuses() {
        assert_eq!(TileError::TargetRequired.code(), "target_required");
        assert_eq!(TileError::TargetRequired.http_status(), 400);

        let busy = TileError::ServerBusy { running: 4, max: 4 };
        assert_eq!(busy.code(), "server_busy");
        assert_eq!(busy.http_status(), 429);

        let dup = TileError::JobAlreadyRunning {
            key: "p:layer:roads".into(),
            id: "abc".into(),
        };
        assert_eq!(dup.code(), "job_already_running");
        assert_eq!(dup.http_status(), 409);

        assert_eq!(TileError::OnDemandPaused.http_status(), 500);
    }
}
