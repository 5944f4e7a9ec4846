//! API routes.

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::limit::RequestBodyLimitLayer;

use crate::handlers::admin::{
    cleanup, extend_lock, force_fail, force_reset, get_health, get_stats, recover_stuck,
    release_lock, validate_job,
};
use crate::handlers::convert::{convert, get_status};
use crate::handlers::worker::{
    extend_lease, report_completion, report_failure, report_progress, start,
};
use crate::handlers::{health, ready};
use crate::metrics::metrics_middleware;
use crate::middleware::{
    cors_layer, rate_limit_middleware, request_id, request_logging, security_headers,
    RateLimiterCache,
};
use crate::state::AppState;
use crate::ws::ws_progress;

/// Create the API router.
pub fn create_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    // Public submission surface
    let convert_routes = Router::new().route("/convert", post(convert));

    // Processing Worker inbound contract
    let worker_routes = Router::new()
        .route("/worker/start", post(start))
        .route("/worker/progress", post(report_progress))
        .route("/worker/complete", post(report_completion))
        .route("/worker/fail", post(report_failure))
        .route("/worker/extend", post(extend_lease));

    // Operator surface; every handler also requires the bearer token
    let admin_routes = Router::new()
        .route("/admin/stats", get(get_stats))
        .route("/admin/health", get(get_health))
        .route("/admin/cleanup", get(cleanup).post(cleanup))
        .route("/admin/recover-stuck", post(recover_stuck))
        .route("/admin/validate-job", get(validate_job))
        .route("/admin/force-fail", post(force_fail))
        .route("/admin/force-reset", post(force_reset))
        .route("/admin/extend-lock", post(extend_lock))
        .route("/admin/release-lock", post(release_lock));

    let rate_limiter = std::sync::Arc::new(RateLimiterCache::new(state.config.rate_limit_rps));

    let api_routes = Router::new()
        .merge(convert_routes)
        .merge(worker_routes)
        .merge(admin_routes)
        .layer(middleware::from_fn_with_state(
            rate_limiter.clone(),
            rate_limit_middleware,
        ));

    // Durable status fallback, rate-limited since it is polled publicly
    let status_routes = Router::new()
        .route("/status/:job_id", get(get_status))
        .layer(middleware::from_fn_with_state(
            rate_limiter,
            rate_limit_middleware,
        ));

    let ws_routes = Router::new().route("/ws/progress", get(ws_progress));

    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/ready", get(ready));

    // Metrics endpoint (if enabled)
    let metrics_routes = if let Some(handle) = metrics_handle {
        Router::new().route("/metrics", get(move || async move { handle.render() }))
    } else {
        Router::new()
    };

    Router::new()
        .nest("/api", api_routes)
        .merge(status_routes)
        .merge(ws_routes)
        .merge(health_routes)
        .merge(metrics_routes)
        .layer(RequestBodyLimitLayer::new(state.config.max_body_size))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(security_headers))
        .layer(middleware::from_fn(request_id))
        .layer(middleware::from_fn(request_logging))
        .layer(cors_layer(&state.config.cors_origins))
        .with_state(state)
}
