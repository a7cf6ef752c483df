//! Downstream server for the fanout relay.
//!
//! Accepts WebSocket clients on any path, fans upstream frames out to
//! them, and funnels their frames back upstream through the rate
//! limiter. `GET /health` reports upstream state and traffic counters.

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

pub mod relay;
pub mod routes;
pub mod state;
pub mod ws;

use relay::Relay;
use state::AppState;

/// Build the HTTP router for a running relay.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()`
/// so the upgrade handler can record each client's address.
pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .merge(routes::health::router())
        .fallback(ws::ws_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { relay })
}
