//! faultline disruption controller
//!
//! Watches disruptions, picks their targets, runs one injection agent per
//! target and fault kind, and keeps each disruption's status in line with
//! its agents until it expires or is deleted.

use std::sync::Arc;

use anyhow::{Context, Result};
use faultline_controller::{
    api,
    config::Config,
    controller::{Controller, WorkQueue},
    ipranges::IpRangeCatalog,
    lifecycle::OrphanSweeper,
    metrics::Metrics,
    platform::{InMemoryPlatform, Platform, SeedState},
    reconciler::DisruptionReconciler,
    state::AppState,
    watch::CacheContextRegistry,
};
use faultline_reconcile::JitteredRequeue;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

async fn load_platform(config: &Config) -> Result<Arc<InMemoryPlatform>> {
    let Some(path) = &config.seed_file else {
        return Ok(Arc::new(InMemoryPlatform::new()));
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading seed file {}", path.display()))?;
    let seed: SeedState = serde_json::from_str(&raw)
        .with_context(|| format!("parsing seed file {}", path.display()))?;
    info!(
        disruptions = seed.disruptions.len(),
        pods = seed.pods.len(),
        nodes = seed.nodes.len(),
        "Seeding platform"
    );
    Ok(Arc::new(InMemoryPlatform::seeded(seed).await))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to FAULTLINE_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting faultline controller");
    info!(
        listen_addr = %config.listen_addr,
        workers = config.workers,
        safemode = config.safemode,
        "Configuration loaded"
    );

    let catalog = match &config.cloud_ip_ranges_file {
        Some(path) => IpRangeCatalog::from_file(path)
            .with_context(|| format!("loading cloud IP ranges from {}", path.display()))?,
        None => IpRangeCatalog::default(),
    };
    info!(services = catalog.len(), "Cloud IP ranges loaded");

    let platform: Arc<dyn Platform> = load_platform(&config).await?;
    let metrics = Metrics::from_kind(config.metrics_sink);
    let caches = Arc::new(CacheContextRegistry::new());
    let queue = WorkQueue::new();

    let reconciler = Arc::new(DisruptionReconciler::new(
        &config,
        platform.clone(),
        Arc::new(catalog),
        caches.clone(),
        queue.clone(),
        metrics.clone(),
    ));
    let sweeper = Arc::new(OrphanSweeper::new(
        platform.clone(),
        caches.clone(),
        metrics.clone(),
        config.orphan_sweep_interval,
    ));
    let controller = Arc::new(Controller::new(
        platform.clone(),
        reconciler,
        queue,
        sweeper,
        caches.clone(),
        metrics,
        config.workers,
        config.resync_interval,
        JitteredRequeue::new(config.requeue_min, config.requeue_max),
    ));

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let controller_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            controller.run(shutdown_rx).await;
        }
    });

    let state = AppState::new(platform, caches, config.default_duration);
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for the controller to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, controller_handle).await {
        warn!(error = %e, "Controller did not shut down in time");
    }

    info!("Controller shutdown complete");
    Ok(())
}
