mod config;
mod monitor;

use crate::config::Config;
use anyhow::Context;
use clap::Parser;
use pointstream::{HttpTransport, Pipeline, PipelineMetrics};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Initialization ---
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();
    let config = Config::parse();
    tracing::info!(config = ?config, "Agent starting with configuration");

    let metrics = Arc::new(PipelineMetrics::new().context("Failed to register metrics")?);
    let transport =
        HttpTransport::new(config.fetch_timeout()).context("Failed to build HTTP client")?;
    let mut pipeline = Pipeline::new(config.pipeline_config(), transport, metrics.clone())
        .context("Failed to initialize pipeline")?;
    pipeline.set_anchor(config.anchor);

    // --- 2. Start Metrics Server ---
    let metrics_router = metrics.router();
    let metrics_addr: std::net::SocketAddr = config
        .metrics_listen_addr
        .parse()
        .context("Failed to parse metrics listen address")?;
    let listener = tokio::net::TcpListener::bind(metrics_addr)
        .await
        .with_context(|| format!("Failed to bind metrics server on {metrics_addr}"))?;
    tracing::info!(addr = %metrics_addr, "Agent metrics server started");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, metrics_router.into_make_service()).await {
            tracing::error!(error = %e, "Metrics server failed");
        }
    });

    // --- 3. Spawn Pipeline and Frame Monitor ---
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let monitor_handle = tokio::spawn(monitor::run(
        pipeline.subscribe(),
        shutdown_rx.clone(),
        config.report_interval(),
    ));
    let pipeline_handle = tokio::spawn(pipeline.run(shutdown_rx));

    // --- 4. Wait for Shutdown ---
    shutdown_signal().await;
    tracing::info!("Shutdown signal received.");
    drop(shutdown_tx);

    let (pipeline_res, monitor_res) = tokio::join!(pipeline_handle, monitor_handle);
    if let Err(e) = pipeline_res {
        tracing::error!(error = %e, "Pipeline task failed.");
    }
    if let Err(e) = monitor_res {
        tracing::error!(error = %e, "Frame monitor task failed.");
    }

    tracing::info!("Agent shut down.");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
