//! Composition of the upstream link, client registry and rate limiter.
//!
//! [`Relay`] is constructed once at startup via [`Relay::start`] and
//! shared as an `Arc`. Upstream frames are broadcast to every open
//! client in arrival order; client frames go through the rate limiter
//! into the upstream link, or are dropped when the link is not open.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use fanout_core::config::RelayConfig;
use fanout_core::error::RelayError;
use fanout_core::limiter::{Completion, RateLimiter};
use fanout_core::types::Payload;
use fanout_upstream::{LinkConfig, UpstreamLink};

use crate::ws::ClientRegistry;

/// Result of handing a client frame to [`Relay::forward`].
#[must_use]
pub enum ForwardOutcome {
    /// Queued on the rate limiter; resolves once the send was attempted.
    Queued(Completion<Result<(), RelayError>>),
    /// The upstream was not open and the frame was discarded.
    Dropped,
}

/// Running totals of relay traffic.
#[derive(Debug, Default)]
pub struct RelayStats {
    broadcast: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    send_failed: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Upstream frames fanned out to clients.
    pub broadcast: u64,
    /// Client frames sent upstream.
    pub forwarded: u64,
    /// Client frames discarded because the upstream was not open.
    pub dropped: u64,
    /// Client frames whose upstream send failed after being queued.
    pub send_failed: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            broadcast: self.broadcast.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            send_failed: self.send_failed.load(Ordering::Relaxed),
        }
    }
}

/// The relay context object.
pub struct Relay {
    upstream: Arc<UpstreamLink>,
    registry: Arc<ClientRegistry>,
    limiter: RateLimiter,
    stats: Arc<RelayStats>,
    keepalive_interval: Duration,
    /// Master cancellation token -- cancelled during shutdown.
    cancel: CancellationToken,
}

impl Relay {
    /// Build the relay, connect upstream and start the broadcast pump.
    pub fn start(config: &RelayConfig) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let upstream = UpstreamLink::new(
            config.upstream_url.clone(),
            LinkConfig::from(config),
            inbound_tx,
            cancel.child_token(),
        );
        let limiter = RateLimiter::spawn(config.rate_limit, cancel.child_token());
        let registry = Arc::new(ClientRegistry::new());
        let stats = Arc::new(RelayStats::default());

        tokio::spawn(run_broadcast_pump(
            inbound_rx,
            Arc::clone(&registry),
            Arc::clone(&stats),
            cancel.child_token(),
        ));
        upstream.start();

        tracing::info!(
            upstream = %config.upstream_url,
            rate_limit = config.rate_limit.limit,
            window_ms = config.rate_limit.window.as_millis() as u64,
            "Relay started",
        );

        Arc::new(Self {
            upstream,
            registry,
            limiter,
            stats,
            keepalive_interval: config.keepalive_interval,
            cancel,
        })
    }

    /// Fan `payload` out to every open client. Returns the delivery count.
    pub async fn broadcast(&self, payload: Payload) -> usize {
        broadcast_to(&self.registry, &self.stats, payload).await
    }

    /// Send a client frame upstream through the rate limiter.
    ///
    /// If the upstream is not open the frame is dropped and counted;
    /// the client is not told. A frame queued while open but dispatched
    /// after the link went down fails with [`RelayError::NotConnected`]
    /// and is not retried.
    pub fn forward(&self, payload: Payload) -> ForwardOutcome {
        if !self.upstream.is_open() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(bytes = payload.len(), "Upstream not connected, message dropped");
            return ForwardOutcome::Dropped;
        }

        let upstream = Arc::clone(&self.upstream);
        let stats = Arc::clone(&self.stats);
        let completion = self.limiter.submit(move || {
            let result = upstream.send(payload);
            match &result {
                Ok(()) => {
                    stats.forwarded.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Sent upstream (rate-limited)");
                }
                Err(e) => {
                    stats.send_failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "Upstream send failed, message discarded");
                }
            }
            std::future::ready(result)
        });

        ForwardOutcome::Queued(completion)
    }

    pub fn upstream(&self) -> &Arc<UpstreamLink> {
        &self.upstream
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Heartbeat interval applied to every client connection.
    pub fn keepalive_interval(&self) -> Duration {
        self.keepalive_interval
    }

    /// Parent token for per-client session tokens.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stop the upstream link, the limiter and every client session.
    ///
    /// Waits up to `grace` for client sessions to send their close
    /// frames, then drops whatever is left.
    pub async fn shutdown(&self, grace: Duration) {
        tracing::info!("Shutting down relay");
        self.cancel.cancel();

        let drained = tokio::time::timeout(grace, async {
            while self.registry.client_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .is_ok();

        if !drained {
            self.registry.shutdown_all().await;
        }
        tracing::info!("Relay shut down complete");
    }
}

async fn broadcast_to(registry: &ClientRegistry, stats: &RelayStats, payload: Payload) -> usize {
    let bytes = payload.len();
    let delivered = registry.broadcast(payload).await;
    stats.broadcast.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(bytes, delivered, "Broadcast upstream message");
    delivered
}

/// Drain upstream frames into the registry in arrival order.
async fn run_broadcast_pump(
    mut inbound: mpsc::UnboundedReceiver<Payload>,
    registry: Arc<ClientRegistry>,
    stats: Arc<RelayStats>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            payload = inbound.recv() => match payload {
                Some(payload) => {
                    broadcast_to(&registry, &stats, payload).await;
                }
                None => break,
            },
        }
    }
    tracing::debug!("Broadcast pump stopped");
}
