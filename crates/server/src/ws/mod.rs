//! Downstream WebSocket side of the relay.
//!
//! Provides the client registry and the HTTP upgrade handler that runs
//! one session loop per connected client.

mod handler;
pub mod registry;

pub use handler::ws_handler;
pub use registry::ClientRegistry;
