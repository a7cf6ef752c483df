//! Shared building blocks for the fanout relay.
//!
//! Holds the payload and connection types passed between the upstream
//! link and the downstream registry, the error taxonomy, configuration
//! loading, and the timing primitives (reconnect backoff, heartbeat
//! probe, windowed rate limiter) both sides are built on.

pub mod backoff;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod limiter;
pub mod types;
