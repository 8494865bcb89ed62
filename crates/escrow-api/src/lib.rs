//! # escrow-api: Axum API Services for Escrow Fund Release
//!
//! HTTP surface over the [`escrow_workflow`] engine. Handlers translate
//! requests into engine commands and map [`escrow_workflow::EscrowError`]
//! to structured JSON errors; no business rules live here.
//!
//! ## API Surface
//!
//! | Prefix                              | Module                 | Domain            |
//! |-------------------------------------|------------------------|-------------------|
//! | `/v1/escrows/*`                     | [`routes::escrows`]    | Escrows, conditions, requests, reviews |
//! | `/v1/escrows/{id}/audit*`           | [`routes::escrows`]    | Audit trail       |
//! | `/openapi.json`                     | [`openapi`]            | OpenAPI 3.1 document  |
//! | `/health/*`, `/metrics`             | this module            | Probes and Prometheus (unauthenticated) |
//!
//! ## Middleware Stack (execution order)
//!
//! ```text
//! TraceLayer → MetricsMiddleware → AuthMiddleware → Handler
//! ```

pub mod auth;
pub mod error;
pub mod extractors;
pub mod middleware;
pub mod openapi;
pub mod routes;
pub mod state;
pub mod sweeper;

use axum::extract::State;
use axum::middleware::from_fn;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::auth::AuthConfig;
use crate::middleware::metrics::ApiMetrics;
use crate::state::AppState;

pub use error::AppError;

/// Assemble the full application router with all routes and middleware.
///
/// Health probes and `/metrics` are mounted outside the auth middleware
/// so they remain accessible without credentials.
pub fn app(state: AppState) -> Router {
    app_with_metrics(state, ApiMetrics::new())
}

/// Like [`app`], sharing the given request counters.
pub fn app_with_metrics(state: AppState, metrics: ApiMetrics) -> Router {
    let auth_config = AuthConfig {
        token: state.config.auth_token.clone(),
    };

    // Authenticated API routes.
    let api = Router::new()
        .merge(routes::escrows::router())
        .merge(openapi::router())
        .layer(from_fn(auth::auth_middleware))
        .layer(from_fn(middleware::metrics::metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(axum::Extension(auth_config))
        .layer(axum::Extension(metrics))
        .with_state(state.clone());

    // Unauthenticated operational endpoints.
    let ops = Router::new()
        .route("/health/liveness", get(liveness))
        .route("/health/readiness", get(readiness))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state);

    Router::new().merge(ops).merge(api)
}

/// Liveness probe: always returns 200 if the process is running.
async fn liveness() -> &'static str {
    "ok"
}

/// Readiness probe: returns 200 when the application is ready to serve.
async fn readiness() -> &'static str {
    "ready"
}

/// Prometheus text exposition; empty when no recorder is installed.
async fn prometheus_metrics(State(state): State<AppState>) -> String {
    state.metrics.as_ref().map(|h| h.render()).unwrap_or_default()
}
