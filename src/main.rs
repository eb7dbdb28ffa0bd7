// Main entry point for the survey photo annotation service

use survey_annotator::{
    api::{self, AppState},
    core::Config,
    services::ArcGisClient,
    utils::Metrics,
};

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How long running batches get to wind down after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::new().context("Failed to load configuration")?);

    // Initialize logging
    let filter = EnvFilter::new(format!(
        "survey_annotator={},tower_http=info",
        match config.log_level() {
            tracing::Level::TRACE => "trace",
            tracing::Level::DEBUG => "debug",
            tracing::Level::INFO => "info",
            tracing::Level::WARN => "warn",
            tracing::Level::ERROR => "error",
        }
    ));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== SURVEY PHOTO ANNOTATOR ===");
    info!(
        "Config: portal={} uploads={} font={}px {} concurrency={}",
        config.portal_url(),
        config.upload_folder().display(),
        config.annotation.font_size,
        config.annotation.font_family,
        config.download_concurrency()
    );

    tokio::fs::create_dir_all(config.upload_folder())
        .await
        .with_context(|| format!("Failed to create {}", config.upload_folder().display()))?;

    let metrics = Metrics::new();

    info!("Initializing feature service client...");
    let client = Arc::new(ArcGisClient::new(&config)?);
    let state = AppState::new(config.clone(), client.clone(), client, metrics);
    let orchestrator = Arc::clone(&state.orchestrator);
    let sweeper = state.spawn_sweeper();
    info!(
        "Unclaimed batches are discarded after {}s (checked every {}s)",
        config.batch_retention().as_secs(),
        config.sweep_interval().as_secs()
    );

    let app = api::router(state);

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    info!("{}", "=".repeat(70));
    info!("Server starting on http://{}", addr);
    info!("{}", "-".repeat(70));
    info!("Endpoints:");
    info!("  GET    /                          - Root endpoint");
    info!("  GET    /health                    - Health check");
    info!("  GET    /metrics                   - Prometheus metrics");
    info!("  GET    /stats                     - Detailed statistics");
    info!("  POST   /sessions                  - Sign in to a feature layer");
    info!("  GET    /sessions/{{id}}/layer       - Layer fields and feature count");
    info!("  POST   /sessions/{{id}}/batches     - Start an annotation batch");
    info!("  GET    /check_status              - Latest batch progress");
    info!("  GET    /batches/{{id}}/status       - Batch progress");
    info!("  GET    /batches/{{id}}/summary      - Batch outcome summary");
    info!("  DELETE /batches/{{id}}              - Cancel a batch");
    info!("  POST   /processed_images/{{id}}     - Download annotated images (ZIP)");
    info!("{}", "=".repeat(70));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped accepting connections, cancelling running batches");
    sweeper.abort();
    orchestrator.shutdown(SHUTDOWN_GRACE).await;
    info!("Graceful shutdown complete");

    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on Unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, starting graceful shutdown"),
        () = terminate => info!("Received SIGTERM, starting graceful shutdown"),
    }
}
