//! # escrow-api: Binary Entry Point
//!
//! Starts the Axum HTTP server for the escrow fund-release API.
//! Binds to a configurable port (default 8080).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use escrow_api::state::{AppConfig, AppState};
use escrow_api::sweeper::ExpirySweeper;
use escrow_workflow::{Dispatcher, EscrowService, LoggingRail, TracingSink, WorkflowConfig};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Upper bound on draining queued notifications at shutdown.
const DISPATCH_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::parse();

    // Initialize structured tracing.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let workflow = WorkflowConfig::from_env().context("invalid workflow configuration")?;
    tracing::info!(?config, ?workflow, "configuration loaded");

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")?;

    let (dispatch, dispatcher) =
        Dispatcher::spawn(&workflow, Arc::new(TracingSink), Arc::new(LoggingRail));
    let service = Arc::new(EscrowService::new(workflow).with_dispatcher(dispatch));
    let sweeper = ExpirySweeper::spawn(Arc::clone(&service), config.sweep_interval());

    let state = AppState::with_service(config.clone(), Arc::clone(&service)).with_metrics(prometheus);
    let app = escrow_api::app(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("escrow API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("escrow API shutting down");
    if let Some(sweeper) = sweeper {
        sweeper.shutdown().await;
    }

    // The dispatcher exits once the last handle, held by the service, is gone.
    drop(service);
    match tokio::time::timeout(DISPATCH_DRAIN_TIMEOUT, dispatcher).await {
        Ok(Ok(())) => tracing::info!("dispatch queue drained"),
        Ok(Err(e)) => tracing::warn!(error = %e, "dispatcher terminated abnormally"),
        Err(_) => tracing::warn!("dispatch queue not drained before timeout"),
    }

    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => tracing::info!("received terminate signal, initiating graceful shutdown"),
    }
}
