//! Persistent connection to the single upstream WebSocket server.
//!
//! [`UpstreamLink`](link::UpstreamLink) owns the connection lifecycle:
//! connect, heartbeat, reconnect with exponential backoff, and a
//! supervisory timer that catches any missed reconnect. Inbound data
//! frames are pushed onto a channel for the relay to broadcast.

pub mod client;
pub mod link;

pub use link::{LinkConfig, UpstreamLink};
