//! Tile cache and OGC endpoint server binary.

use anyhow::Result;
use axum::extract::Extension;
use axum::routing::{delete, get, post};
use axum::Router;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tile_api::cluster;
use tile_api::handlers;
use tile_api::settings::Settings;
use tile_api::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "tile-api")]
#[command(about = "Tile cache and OGC endpoint server")]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:8612")]
    listen: String,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut settings = Settings::from_env();
    let addr: SocketAddr = args.listen.parse()?;
    settings.listen_port = addr.port();

    let role = std::env::var(cluster::ROLE_ENV).unwrap_or_default();

    // The primary becomes a pure supervisor when clustering is on.
    if role != "worker" && settings.worker_count > 1 {
        return cluster::run_supervisor(&settings, &args.listen).await;
    }

    info!("Starting tile cache server");
    let state = AppState::new(settings);
    state.start_background();

    if role == "worker" {
        cluster::start_worker_control();
    }

    let app = router(state);

    let listener = if role == "worker" {
        // Workers share the port; the kernel load-balances connections.
        tokio::net::TcpListener::from_std(cluster::bind_reuseport(addr)?)?
    } else {
        tokio::net::TcpListener::bind(addr).await?
    };
    info!(address = %addr, "Listening");

    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Projects
        .route("/projects", get(handlers::projects::list_projects_handler))
        .route(
            "/projects/:id",
            delete(handlers::projects::delete_project_handler),
        )
        .route(
            "/projects/:id/config",
            get(handlers::projects::get_config_handler)
                .patch(handlers::projects::patch_config_handler),
        )
        .route(
            "/projects/:id/cache/project",
            get(handlers::projects::get_project_batch_handler)
                .post(handlers::projects::post_project_batch_handler),
        )
        // Render jobs
        .route("/generate-cache", post(handlers::jobs::generate_cache_handler))
        .route(
            "/generate-cache/running",
            get(handlers::jobs::running_jobs_handler),
        )
        .route(
            "/generate-cache/admin/orphans",
            get(handlers::jobs::list_orphans_handler),
        )
        .route(
            "/generate-cache/admin/orphans/:id/kill",
            post(handlers::jobs::kill_orphan_handler),
        )
        .route(
            "/generate-cache/admin/:id/diagnose",
            post(handlers::jobs::diagnose_job_handler),
        )
        .route(
            "/generate-cache/abort-all/:project",
            delete(handlers::jobs::abort_all_handler),
        )
        .route(
            "/generate-cache/abort-all/:project/:layer",
            delete(handlers::jobs::abort_all_handler),
        )
        .route(
            "/generate-cache/:id",
            get(handlers::jobs::job_status_handler).delete(handlers::jobs::abort_job_handler),
        )
        .route(
            "/generate-cache/:id/abort",
            post(handlers::jobs::abort_job_post_handler),
        )
        // Admin
        .route("/admin/kill-pid", post(handlers::jobs::kill_pid_handler))
        .route(
            "/admin/restart-workers",
            post(handlers::jobs::restart_workers_handler),
        )
        // Cache index + deletion
        .route(
            "/cache/:project/index.json",
            get(handlers::cache::get_index_handler).patch(handlers::cache::patch_index_handler),
        )
        .route(
            "/cache/:project",
            delete(handlers::cache::delete_project_cache_handler),
        )
        .route(
            "/cache/:project/:name",
            delete(handlers::cache::delete_target_cache_handler),
        )
        // OGC
        .route("/wmts", get(handlers::wmts::wmts_kvp_handler))
        .route(
            "/wmts/rest/:project/:layer/:style/:set/:matrix/:row/:col",
            get(handlers::wmts::wmts_rest_handler),
        )
        .route(
            "/wmts/:project/themes/:name/:z/:x/:y",
            get(handlers::wmts::legacy_theme_tile_handler),
        )
        .route(
            "/wmts/:project/:name/:z/:x/:y",
            get(handlers::wmts::legacy_tile_handler),
        )
        .route("/wms", get(handlers::wms::wms_handler))
        // On-demand control
        .route(
            "/on-demand/abort",
            post(handlers::ondemand::abort_session_handler),
        )
        .route("/on-demand/status", get(handlers::ondemand::status_handler))
        .route(
            "/on-demand/abort-all",
            post(handlers::ondemand::abort_all_handler),
        )
        .route(
            "/viewer/abort",
            post(handlers::ondemand::abort_session_handler),
        )
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
}
