//! Multi-model fan-out gateway.
//!
//! A request names several models. Each one streams its answer back as
//! server-sent events, and once all of them settle a synthesis model merges
//! the successful drafts into one final answer, streamed the same way.

pub mod client;
pub mod config;
pub mod consumer;
pub mod error;
pub mod events;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod provider;
pub mod rate_limit;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod session_lock;
pub mod sse;
pub mod state;
pub mod stream_client;
pub mod synthesis;
pub mod validation;

use axum::{
    Router,
    routing::{get, post},
};

use crate::handlers::{generate_handler, health_handler, metrics_handler, stop_handler};
use crate::state::AppState;

// creating the router with routes
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/generate", post(generate_handler))
        .route("/api/generate/stop", post(stop_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
