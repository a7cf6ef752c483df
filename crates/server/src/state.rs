use std::sync::Arc;

use crate::relay::Relay;

/// Shared application state passed to all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
}
