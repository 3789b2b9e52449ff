//! Health check and stats endpoints
//!
//! - `/health` is liveness: 200 while the process serves requests
//! - `/api/v1/health` is readiness: 503 with component details when the
//!   broker, the remote storage or the relay is down

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::readiness::ReadinessReport;
use crate::relay::RelayStatsSnapshot;
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub service: &'static str,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub service: &'static str,
    #[serde(flatten)]
    pub components: ReadinessReport,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    /// Content hashes currently in flight
    pub reservations: usize,
    /// Messages waiting on the broker queue
    pub queue_depth: u64,
    pub relay: RelayStatsSnapshot,
    pub started_at: DateTime<Utc>,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = if state.readiness().is_ready() {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        service: "file-relay",
    })
}

pub async fn readiness_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let components = state.readiness().report();
    let (code, status) = if components.ready {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        code,
        Json(ReadinessResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
            service: "file-relay",
            components,
        }),
    )
}

pub async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>> {
    let queue = state.publisher().queue();
    let queue_depth = state
        .broker()
        .depth(queue)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to read queue depth: {}", e)))?;

    Ok(Json(StatsResponse {
        reservations: state.hash_store().len(),
        queue_depth,
        relay: state.relay_stats().snapshot(),
        started_at: state.started_at(),
    }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(health_check))
}

pub fn readiness_router() -> Router<AppState> {
    Router::new().route("/", get(readiness_check))
}

pub fn stats_router() -> Router<AppState> {
    Router::new().route("/", get(stats))
}
