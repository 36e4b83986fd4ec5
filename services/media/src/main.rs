use anyhow::{Context, Result};
use recipe_media::{
    start_api_server, AppState, Config, LocalBlobStore, MediaStore, PgReferenceStore,
    ReferenceCache, ReferenceData,
};
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Recipe Media Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Media storage
    let blobs = Arc::new(LocalBlobStore::new(
        config.media.storage_dir(),
        config.media.staging_dir(),
    ));
    blobs
        .ensure_dir()
        .await
        .context("Failed to create media directory")?;
    let media = Arc::new(MediaStore::new(blobs, &config.media));

    // Reference data
    let reference_store = Arc::new(
        PgReferenceStore::new(&config.database)
            .await
            .context("Failed to initialize reference store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        reference_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let cache = Arc::new(ReferenceCache::new());
    let reference = Arc::new(ReferenceData::new(
        cache.clone(),
        reference_store,
        &config.cache,
    ));

    let state = AppState {
        media,
        reference,
        cache,
        admin_token: config.api.admin_token.as_deref().map(Arc::from),
    };

    if state.admin_token.is_none() {
        info!("No admin token configured, admin endpoints are disabled");
    }

    start_api_server(state, &config.api, &config.media, shutdown_signal())
        .await
        .context("API server failed")?;

    info!("Media service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM signal, shutting down");
        }
    }
}
