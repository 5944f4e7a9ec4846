//! Axum HTTP/WS API server.
//!
//! This crate provides:
//! - Job submission and status polling
//! - The Processing Worker inbound contract (claim, progress, completion)
//! - WebSocket progress push with polling as the durable fallback
//! - Bearer-token administrative control plane
//! - Rate limiting, security headers, and Prometheus metrics

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod ws;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
