//! # Application State
//!
//! Shared state for the Axum application, passed to all route handlers
//! via the `State` extractor.
//!
//! The workflow engine owns every escrow, the audit trail and the snapshot
//! store; handlers only translate between HTTP and
//! [`EscrowService`] calls.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use escrow_workflow::{EscrowService, WorkflowConfig};
use metrics_exporter_prometheus::PrometheusHandle;

/// Application configuration.
///
/// Every option falls back to an environment variable. Custom `Debug`
/// redacts the `auth_token` to prevent credential leakage in logs.
#[derive(Clone, Parser)]
#[command(name = "escrow-api", version, about = "Escrow fund-release authorization API")]
pub struct AppConfig {
    /// Port to bind the HTTP server to.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,
    /// Static bearer token. If unset, authentication is disabled and only
    /// the `X-Actor-Id` header identifies the caller.
    #[arg(long, env = "AUTH_TOKEN")]
    pub auth_token: Option<String>,
    /// Emit logs as JSON lines.
    #[arg(long, env = "ESCROW_JSON_LOGS")]
    pub json_logs: bool,
    /// Seconds between request expiry sweeps.
    #[arg(
        long,
        env = "ESCROW_SWEEP_INTERVAL_SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub sweep_interval_secs: u64,
}

impl AppConfig {
    /// Interval between expiry sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            auth_token: None,
            json_logs: false,
            sweep_interval_secs: 60,
        }
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("port", &self.port)
            .field(
                "auth_token",
                &self.auth_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("json_logs", &self.json_logs)
            .field("sweep_interval_secs", &self.sweep_interval_secs)
            .finish()
    }
}

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// The workflow engine.
    pub service: Arc<EscrowService>,
    /// Application configuration.
    pub config: AppConfig,
    /// Prometheus renderer; `None` when no recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("service", &self.service)
            .field("config", &self.config)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

impl AppState {
    /// State with default configuration and a fresh in-memory engine.
    pub fn new() -> Self {
        Self::with_config(AppConfig::default(), WorkflowConfig::default())
    }

    /// State with the given configuration and a fresh in-memory engine.
    pub fn with_config(config: AppConfig, workflow: WorkflowConfig) -> Self {
        Self::with_service(config, Arc::new(EscrowService::new(workflow)))
    }

    /// State around an existing engine.
    pub fn with_service(config: AppConfig, service: Arc<EscrowService>) -> Self {
        Self {
            service,
            config,
            metrics: None,
        }
    }

    /// Attach the Prometheus renderer served at `/metrics`.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
