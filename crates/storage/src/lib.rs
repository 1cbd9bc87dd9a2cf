//! Disk persistence for the tile cache server.
//!
//! Provides:
//! - Atomic JSON documents with `.bak` fallback
//! - The per-project tile tree layout and safe cache deletion
//! - Structural tile validation (PNG signature + IHDR)
//! - Append-only per-project event logs

pub mod fsjson;
pub mod layout;
pub mod project_log;
pub mod tile_check;

pub use fsjson::{read_json_with_backup, write_atomic_with_backup};
pub use layout::{purge_dir, CacheLayout, TargetKind, THEMES_DIR};
pub use project_log::ProjectLog;
pub use tile_check::{png_header_ok, tile_file_status, TileFileStatus};
