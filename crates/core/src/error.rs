/// Runtime errors raised while moving payloads through the relay.
///
/// None of these are fatal to the process; each one is local to the
/// connection or task that produced it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// The upstream connection is not open, so the payload cannot be sent.
    #[error("Upstream is not connected")]
    NotConnected,

    /// The task or connection on the other end of a channel has gone away.
    #[error("Channel closed")]
    ChannelClosed,

    /// The WebSocket transport reported a failure.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Errors raised while loading [`RelayConfig`](crate::config::RelayConfig).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} has invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}
