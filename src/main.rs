use anyhow::{Context, Result};
use deposit_service::api::{start_api_server, AppState};
use deposit_service::blob_store::S3BlobStore;
use deposit_service::config::Config;
use deposit_service::deposit::DepositPipeline;
use deposit_service::record_store::PostgrestRecordStore;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
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
        "Starting deposit service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize clients; both are explicitly constructed and owned here,
    // then handed to the pipeline
    let blob_store = Arc::new(
        S3BlobStore::new(&config.blob_store)
            .await
            .context("Failed to initialize blob store client")?,
    );

    let record_store = Arc::new(
        PostgrestRecordStore::new(&config.record_store)
            .context("Failed to initialize record store client")?,
    );

    let pipeline = Arc::new(DepositPipeline::new(blob_store, record_store));

    // Shutdown token: cancelling it drains the server and aborts in-flight
    // deposits so they can run compensation
    let shutdown = CancellationToken::new();

    let state = AppState {
        pipeline,
        shutdown: shutdown.clone(),
    };

    let api_config = config.api.clone();
    let server_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(state, &api_config, server_shutdown).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    info!("Deposit service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down deposit service");
    shutdown.cancel();

    let _ = api_handle.await;

    info!("Deposit service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

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
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
