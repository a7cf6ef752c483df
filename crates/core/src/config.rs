use std::str::FromStr;
use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::error::ConfigError;
use crate::limiter::RateLimitConfig;

/// Relay configuration loaded from environment variables.
///
/// Everything except the upstream URL has a default matching the
/// reference deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// WebSocket URL of the upstream server.
    pub upstream_url: String,
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `80`).
    pub port: u16,
    /// Upstream sends allowed per window (default: 5 per 10s).
    pub rate_limit: RateLimitConfig,
    /// Interval between heartbeat pings on every connection (default: 20s).
    pub keepalive_interval: Duration,
    /// Reconnect delay floor and ceiling (default: 1s to 30s).
    pub backoff: BackoffConfig,
    /// How often the safety-net check reconnects a dead upstream (default: 5s).
    pub supervisor_interval: Duration,
    /// Upper bound on the upstream TCP connect plus handshake (default: 10s).
    pub connect_timeout: Duration,
}

impl RelayConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                      | Default   |
    /// |------------------------------|-----------|
    /// | `UPSTREAM_URL`               | required  |
    /// | `HOST`                       | `0.0.0.0` |
    /// | `PORT`                       | `80`      |
    /// | `RATE_LIMIT_COUNT`           | `5`       |
    /// | `RATE_LIMIT_WINDOW_MS`       | `10000`   |
    /// | `KEEPALIVE_INTERVAL_MS`      | `20000`   |
    /// | `RECONNECT_INITIAL_DELAY_MS` | `1000`    |
    /// | `RECONNECT_MAX_DELAY_MS`     | `30000`   |
    /// | `SUPERVISOR_INTERVAL_MS`     | `5000`    |
    /// | `CONNECT_TIMEOUT_MS`         | `10000`   |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let upstream_url = lookup("UPSTREAM_URL")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("UPSTREAM_URL"))?;
        if !(upstream_url.starts_with("ws://") || upstream_url.starts_with("wss://")) {
            return Err(ConfigError::Invalid {
                key: "UPSTREAM_URL",
                value: upstream_url,
                reason: "must start with ws:// or wss://".into(),
            });
        }

        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = parse_or(&lookup, "PORT", 80)?;

        let limit: usize = parse_or(&lookup, "RATE_LIMIT_COUNT", 5)?;
        if limit == 0 {
            return Err(ConfigError::Invalid {
                key: "RATE_LIMIT_COUNT",
                value: "0".into(),
                reason: "a limit of zero would never admit a message".into(),
            });
        }

        let rate_limit = RateLimitConfig {
            limit,
            window: millis_or(&lookup, "RATE_LIMIT_WINDOW_MS", 10_000)?,
        };
        let keepalive_interval = millis_or(&lookup, "KEEPALIVE_INTERVAL_MS", 20_000)?;
        let backoff = BackoffConfig {
            initial_delay: millis_or(&lookup, "RECONNECT_INITIAL_DELAY_MS", 1_000)?,
            max_delay: millis_or(&lookup, "RECONNECT_MAX_DELAY_MS", 30_000)?,
        };
        if backoff.max_delay < backoff.initial_delay {
            return Err(ConfigError::Invalid {
                key: "RECONNECT_MAX_DELAY_MS",
                value: backoff.max_delay.as_millis().to_string(),
                reason: "must not be below RECONNECT_INITIAL_DELAY_MS".into(),
            });
        }
        let supervisor_interval = millis_or(&lookup, "SUPERVISOR_INTERVAL_MS", 5_000)?;
        let connect_timeout = millis_or(&lookup, "CONNECT_TIMEOUT_MS", 10_000)?;

        Ok(Self {
            upstream_url,
            host,
            port,
            rate_limit,
            keepalive_interval,
            backoff,
            supervisor_interval,
            connect_timeout,
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

/// Parse a non-zero millisecond duration.
fn millis_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    let ms: u64 = parse_or(lookup, key, default)?;
    if ms == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: "0".into(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(Duration::from_millis(ms))
}
