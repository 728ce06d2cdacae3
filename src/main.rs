mod api;
mod client;
mod config;
mod device_config;
mod discovery;
mod drift;
mod drift_scheduler;
mod error;
mod metrics;
mod model;
mod notify;
mod plugins;
mod response;
mod store;
mod sync;
mod template;
mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use api::AppState;
use client::{ClientFactory, ClientOptions};
use config::AppConfig;
use drift_scheduler::DriftScheduler;
use metrics::Collector;
use notify::Notifier;
use plugins::backup::BackupPlugin;
use plugins::gitops::GitopsPlugin;
use plugins::sma::SmaPlugin;
use plugins::structured::StructuredPlugin;
use plugins::{PluginRegistry, PluginType};
use sync::SyncEngine;
use template::TemplateEngine;
use websocket::Hub;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(AppConfig::load()?);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{},shelly_manager=debug", config.log.level))
        }))
        .init();

    tracing::info!("Starting Shelly Manager v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        port = config.http.port,
        db = %config.database.path.display(),
        networks = config.discovery.networks.len(),
        "configuration loaded"
    );

    // A dead store at startup is fatal.
    let store = store::open(&config.database)?;

    let factory = Arc::new(ClientFactory::new(ClientOptions::default()));
    let templates = Arc::new(TemplateEngine::new());
    let notifier = Notifier::new(store.clone());

    let scheduler = DriftScheduler::new(
        store.clone(),
        factory.clone(),
        notifier.clone(),
        config.plugins.drift_workers,
    );

    // ── Plugin registry ──────────────────────────────────
    let registry = Arc::new(PluginRegistry::new());
    registry
        .register(PluginType::Sync, Arc::new(SmaPlugin::new(store.clone())))
        .await?;
    registry
        .register(PluginType::Sync, Arc::new(StructuredPlugin::json(store.clone())))
        .await?;
    registry
        .register(PluginType::Sync, Arc::new(StructuredPlugin::yaml(store.clone())))
        .await?;
    registry
        .register(PluginType::Sync, Arc::new(GitopsPlugin::new(store.clone())))
        .await?;
    registry
        .register(PluginType::Backup, Arc::new(BackupPlugin::new(store.clone())))
        .await?;
    tracing::info!(count = registry.list().len(), "plugins registered");

    let sync_engine = SyncEngine::new(
        store.clone(),
        registry,
        notifier.clone(),
        config.plugins.output_dir.clone(),
    );

    // ── Metrics collector + WebSocket hub ────────────────
    let collector = Collector::new(
        store.clone(),
        Duration::from_secs(config.metrics.interval_secs.max(1)),
    );
    let hub = Hub::new(collector.clone());
    tokio::spawn(collector.clone().run());

    // ── Drift scheduler loop ─────────────────────────────
    tokio::spawn(scheduler.clone().run_loop());

    // ── TTL sweep for discovered devices ─────────────────
    {
        let store = store.clone();
        let interval = Duration::from_secs(config.discovery.cleanup_interval_secs.max(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match store.cleanup_expired_discovered(chrono::Utc::now()) {
                    Ok(0) => {}
                    Ok(removed) => {
                        tracing::debug!(removed, "swept expired discovery records");
                    }
                    Err(e) => tracing::warn!(error = %e, "discovery TTL sweep failed"),
                }
            }
        });
    }

    let app_state = Arc::new(AppState {
        store,
        config: config.clone(),
        factory,
        templates,
        scheduler,
        sync: sync_engine,
        collector,
        hub,
        started_at: std::time::Instant::now(),
    });

    let app = api::router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shelly Manager shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { tracing::info!("Received SIGINT, shutting down"); }
        _ = terminate => { tracing::info!("Received SIGTERM, shutting down"); }
    }
}
