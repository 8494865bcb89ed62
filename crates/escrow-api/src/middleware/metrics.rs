//! # HTTP Metrics
//!
//! Counts escrow API traffic two ways:
//!
//! - `escrow_http_requests_total{route, method, status}` through the
//!   `metrics` facade, scraped from `/metrics` when the Prometheus recorder
//!   is installed. `route` is the matched template
//!   (`/v1/escrows/{id}/requests/{request_id}/reviews`), never the raw path,
//!   so escrow and request ids do not explode label cardinality.
//! - [`ApiMetrics`], in-process atomics for tests and embedding callers.
//!
//! A `409` is counted separately as a conflict: the workflow refused the
//! command because of the escrow's state (an active request, a finalized
//! request, a stale `If-Match` version or an overdraw).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::{MatchedPath, Request};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;

/// In-process request counters shared across clones.
#[derive(Debug, Clone, Default)]
pub struct ApiMetrics {
    requests: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
    conflicts: Arc<AtomicU64>,
}

impl ApiMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests that reached the API router.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Responses with a 4xx or 5xx status.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Commands the workflow refused with `409 Conflict`.
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    fn observe(&self, status: StatusCode) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if status.is_client_error() || status.is_server_error() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        if status == StatusCode::CONFLICT {
            self.conflicts.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn status_class(status: StatusCode) -> &'static str {
    match status.as_u16() {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

/// Counts every request against the escrow API.
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let counters = request.extensions().get::<ApiMetrics>().cloned();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let method = request.method().to_string();

    let response = next.run(request).await;

    let status = response.status();
    metrics::counter!(
        "escrow_http_requests_total",
        "route" => route,
        "method" => method,
        "status" => status_class(status)
    )
    .increment(1);
    if let Some(counters) = counters {
        counters.observe(status);
    }
    response
}
