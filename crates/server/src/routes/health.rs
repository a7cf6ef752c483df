use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use fanout_core::types::ConnectionState;

use crate::relay::StatsSnapshot;
use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// `ok` while the upstream is open, `degraded` otherwise.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    pub upstream: ConnectionState,
    /// Number of connected downstream clients.
    pub clients: usize,
    pub stats: StatsSnapshot,
}

/// GET /health -- returns upstream state and relay counters.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let upstream = state.relay.upstream().state();
    let status = if upstream.is_open() { "ok" } else { "degraded" };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        upstream,
        clients: state.relay.registry().client_count().await,
        stats: state.relay.stats(),
    })
}

/// Mount health check routes.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
