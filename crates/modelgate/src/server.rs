//! Server bootstrap
//!
//! Wires detection, catalog, downloads, the lifecycle manager and the
//! dispatcher into one [`AppState`], serves the HTTP API and stops every
//! engine process on shutdown.

use anyhow::Context;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::api::{activity_api, chat_api, models_api, system_api, track_requests};
use crate::catalog::{HuggingFaceRegistry, Resolver};
use crate::config::Config;
use crate::download::DownloadManager;
use crate::gpu::{self, GpuTracker};
use crate::lifecycle::LifecycleManager;
use crate::metrics;
use crate::model_runtime::LlamaServerLauncher;
use crate::shared_state::AppState;
use crate::stats::StatsCollector;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);
const QUICK_ROUTE_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing();
    crate::metrics::init_metrics();
    cfg.print_config();

    let addr = cfg.api_addr()?;
    let state = build_app_state(cfg).await?;
    let shutdown = CancellationToken::new();
    let maintenance = spawn_maintenance(state.clone(), shutdown.clone());

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    let app = build_router(state.clone());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    let _ = maintenance.await;
    state.lifecycle.shutdown().await;
    state.stats.flush().await;
    info!("Server stopped");
    Ok(())
}

pub async fn build_app_state(cfg: Config) -> anyhow::Result<AppState> {
    tokio::fs::create_dir_all(&cfg.download_dir)
        .await
        .with_context(|| format!("cannot create download dir {}", cfg.download_dir.display()))?;

    let inventory = gpu::detect_devices(cfg.gpu_memory_mb.as_deref())?;
    let gpus = Arc::new(GpuTracker::new(inventory.devices.clone()));

    let registry = Arc::new(
        HuggingFaceRegistry::new(cfg.registry_url.clone(), cfg.hf_token.clone())
            .context("failed to build registry client")?,
    );
    let resolver = Arc::new(Resolver::new(registry, cfg.resolver_config()));
    let downloads = Arc::new(
        DownloadManager::new(cfg.download_config()).context("failed to build download client")?,
    );
    let launcher = Arc::new(LlamaServerLauncher::new(cfg.llama_settings()?)?);
    let stats = StatsCollector::start(cfg.activity_stats_file.clone());

    let lifecycle = Arc::new(LifecycleManager::new(
        resolver,
        downloads,
        gpus,
        launcher,
        stats.clone(),
        cfg.footprint_estimator(),
        cfg.lifecycle_config(inventory.is_cpu_only()),
    ));

    Ok(AppState::new(Arc::new(cfg), lifecycle, stats, inventory))
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
        ])
        .allow_headers(Any);

    let quick = Router::new()
        .route("/models/search", get(models_api::search))
        .route("/models/download", post(models_api::download))
        .route("/models/downloads", get(models_api::list_downloads))
        .route(
            "/models/downloads/:id",
            get(models_api::get_download).delete(models_api::cancel_download),
        )
        .route("/models/downloads/:id/pause", post(models_api::pause_download))
        .route("/models/downloads/:id/resume", post(models_api::resume_download))
        .route("/models/loaded", get(models_api::loaded))
        .route("/models/unload", post(models_api::unload))
        .route("/system/specs", get(system_api::specs))
        .route("/gpu/stats", get(system_api::gpu_stats))
        .route(
            "/activity/stats",
            get(activity_api::get_stats).delete(activity_api::reset_stats),
        )
        .route_layer(TimeoutLayer::new(QUICK_ROUTE_TIMEOUT));

    // Loads can include a multi-gigabyte download; the dispatcher applies
    // its own request timeout.
    let long_running = Router::new()
        .route("/models/load", post(models_api::load))
        .route("/chat/completions", post(chat_api::chat_completions))
        .route("/v1/chat/completions", post(chat_api::chat_completions));

    Router::new()
        .merge(quick)
        .merge(long_running)
        .route_layer(middleware::from_fn(track_requests))
        .route("/healthz", get(|| async { "OK" }))
        .route("/metrics", get(metrics::get_metrics))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Prunes finished download records and runs the idle reaper.
fn spawn_maintenance(state: AppState, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let pruned = state.downloads().prune_finished();
                    let reaped = state.lifecycle.reap_idle().await;
                    if pruned + reaped > 0 {
                        debug!("Maintenance: pruned {} download(s), unloaded {} idle instance(s)", pruned, reaped);
                    }
                }
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
