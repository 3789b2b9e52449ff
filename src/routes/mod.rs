//! HTTP routes
//!
//! - `POST /api/v1/files/upload`: multipart ingestion
//! - `GET /health`: liveness
//! - `GET /api/v1/health`: readiness (503 when degraded)
//! - `GET /api/v1/stats`: pipeline counters

pub mod health;
pub mod upload;

use axum::{extract::DefaultBodyLimit, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    let max_upload_bytes = state.config().server.max_upload_bytes;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/health", health::router())
        .nest("/api/v1/health", health::readiness_router())
        .nest("/api/v1/stats", health::stats_router())
        .nest("/api/v1/files", upload::router())
        // Enforced while the multipart body is read, so oversize uploads get a JSON 400
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
