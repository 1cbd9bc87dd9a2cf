//! Application state and shared subsystems.

use std::sync::Arc;
use storage::{CacheLayout, ProjectLog};
use tile_common::TileMatrixSetPreset;
use tokio::sync::mpsc;
use tracing::info;

use crate::config_store::ConfigStore;
use crate::index_store::IndexStore;
use crate::inventory::InventoryCache;
use crate::jobs::JobManager;
use crate::ondemand::OnDemandPool;
use crate::projects;
use crate::schedule::Scheduler;
use crate::settings::Settings;

/// Shared application state, one per worker process.
pub struct AppState {
    pub settings: Arc<Settings>,
    pub layout: CacheLayout,
    pub log: Arc<ProjectLog>,
    pub config: Arc<ConfigStore>,
    pub index: Arc<IndexStore>,
    pub presets: Arc<Vec<TileMatrixSetPreset>>,
    pub jobs: JobManager,
    pub scheduler: Scheduler,
    pub ondemand: OnDemandPool,
    pub inventory: InventoryCache,
}

impl AppState {
    pub fn new(settings: Settings) -> Arc<Self> {
        let settings = Arc::new(settings);
        let layout = CacheLayout::new(&settings.cache_dir);
        let log = Arc::new(ProjectLog::new(&settings.logs_dir));
        let config = Arc::new(ConfigStore::new(layout.clone(), settings.clone()));
        let index = Arc::new(IndexStore::new(layout.clone(), settings.clone()));

        let presets = Arc::new(TileMatrixSetPreset::load_dir(&settings.tile_grids_dir()));
        info!(presets = presets.len(), "Loaded tile-matrix presets");

        let jobs = JobManager::new(
            settings.clone(),
            layout.clone(),
            log.clone(),
            config.clone(),
            index.clone(),
            presets.clone(),
        );
        let scheduler = Scheduler::new(
            settings.clone(),
            config.clone(),
            index.clone(),
            layout.clone(),
            log.clone(),
        );
        let ondemand = OnDemandPool::new(
            settings.clone(),
            config.clone(),
            index.clone(),
            presets.clone(),
        );
        let inventory = InventoryCache::new(&settings, layout.clone(), presets.clone());

        Arc::new(Self {
            settings,
            layout,
            log,
            config,
            index,
            presets,
            jobs,
            scheduler,
            ondemand,
            inventory,
        })
    }

    /// Start the background machinery: project bootstrap, orphan scan,
    /// scheduler timers + heartbeat, and the renderer worker pool.
    pub fn start_background(&self) {
        projects::bootstrap_projects(&self.settings, &self.layout, &self.config, &self.index);

        let (reschedule_tx, reschedule_rx) = mpsc::unbounded_channel();
        self.config.set_reschedule_channel(reschedule_tx);

        self.jobs.scan_orphans();
        self.scheduler.start(reschedule_rx);
        self.ondemand.start();
    }
}
