//! Upstream connection state machine.
//!
//! ```text
//!   Closed --connect()--> Connecting --ok--> Open --close/error/timeout--> Closed
//!                             |                                             |
//!                             +--err--> Closed --schedule_reconnect()--------+
//! ```
//!
//! The `reconnecting` flag is held from the moment a connect attempt or
//! a reconnect timer starts until that attempt opens or fails, so
//! `connect()` calls from the supervisor or a late timer never overlap.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use fanout_core::backoff::{Backoff, BackoffConfig};
use fanout_core::config::RelayConfig;
use fanout_core::error::RelayError;
use fanout_core::heartbeat::{Heartbeat, Probe};
use fanout_core::types::{ConnectionState, Payload};

use crate::client::{UpstreamClient, UpstreamStream};

/// Timing parameters for the upstream link.
#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    /// Interval between heartbeat pings.
    pub keepalive_interval: Duration,
    /// Reconnect delay floor and ceiling.
    pub backoff: BackoffConfig,
    /// Period of the safety-net reconnect check.
    pub supervisor_interval: Duration,
    /// Bound on a single connect attempt.
    pub connect_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_millis(20_000),
            backoff: BackoffConfig::default(),
            supervisor_interval: Duration::from_millis(5_000),
            connect_timeout: Duration::from_millis(10_000),
        }
    }
}

impl From<&RelayConfig> for LinkConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            keepalive_interval: config.keepalive_interval,
            backoff: config.backoff,
            supervisor_interval: config.supervisor_interval,
            connect_timeout: config.connect_timeout,
        }
    }
}

/// The single persistent connection to the upstream server.
///
/// Created once per relay via [`UpstreamLink::new`] and shared as an
/// `Arc`. Every inbound data frame is pushed, in arrival order, onto the
/// `inbound` channel given at construction.
pub struct UpstreamLink {
    client: UpstreamClient,
    config: LinkConfig,
    inner: Mutex<LinkInner>,
    inbound: mpsc::UnboundedSender<Payload>,
    cancel: CancellationToken,
}

struct LinkInner {
    state: ConnectionState,
    /// Feeds the session task's sink while the connection is open.
    outbound: Option<mpsc::UnboundedSender<Message>>,
    backoff: Backoff,
    reconnecting: bool,
    attempts: u64,
}

impl LinkInner {
    /// Claim the reconnect slot, returning the delay to wait.
    fn begin_reconnect(&mut self) -> Option<Duration> {
        if self.reconnecting {
            return None;
        }
        self.reconnecting = true;
        Some(self.backoff.current())
    }
}

/// Why a session ended.
#[derive(Debug)]
enum SessionEnd {
    Closed,
    TimedOut,
    Error(RelayError),
    Shutdown,
}

impl UpstreamLink {
    pub fn new(
        url: String,
        config: LinkConfig,
        inbound: mpsc::UnboundedSender<Payload>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            client: UpstreamClient::new(url, config.connect_timeout),
            config,
            inner: Mutex::new(LinkInner {
                state: ConnectionState::Closed,
                outbound: None,
                backoff: Backoff::new(config.backoff),
                reconnecting: false,
                attempts: 0,
            }),
            inbound,
            cancel,
        })
    }

    /// Connect now and start the supervisory timer.
    pub fn start(self: &Arc<Self>) {
        self.connect();
        self.spawn_supervisor();
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Delay the next reconnect will wait.
    pub fn reconnect_delay(&self) -> Duration {
        self.inner.lock().backoff.current()
    }

    /// Number of connect attempts made so far.
    pub fn attempts(&self) -> u64 {
        self.inner.lock().attempts
    }

    /// Start a connect attempt unless one is already open or pending.
    pub fn connect(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }

        let attempt = {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Closed || inner.reconnecting {
                return;
            }
            inner.reconnecting = true;
            inner.state = ConnectionState::Connecting;
            inner.attempts += 1;
            inner.attempts
        };

        tracing::info!(url = %self.client.url(), attempt, "Connecting to upstream");
        tokio::spawn(Arc::clone(self).run_connection());
    }

    /// Wait out the current backoff delay, then connect again.
    ///
    /// No-op while another connect attempt or reconnect timer is pending.
    pub fn schedule_reconnect(self: &Arc<Self>) {
        let delay = self.inner.lock().begin_reconnect();
        if let Some(delay) = delay {
            self.spawn_reconnect_timer(delay);
        }
    }

    /// Queue `payload` for the upstream socket.
    ///
    /// Only valid while the link is open; callers drop the payload on
    /// [`RelayError::NotConnected`]. Nothing is buffered across
    /// reconnects.
    pub fn send(&self, payload: Payload) -> Result<(), RelayError> {
        let inner = self.inner.lock();
        match (inner.state, inner.outbound.as_ref()) {
            (ConnectionState::Open, Some(tx)) => tx
                .send(Message::from(payload))
                .map_err(|_| RelayError::ChannelClosed),
            _ => Err(RelayError::NotConnected),
        }
    }

    /// Periodically reconnect if the link sits closed with nothing pending.
    pub fn spawn_supervisor(self: &Arc<Self>) -> JoinHandle<()> {
        let link = Arc::clone(self);
        tokio::spawn(async move {
            let period = link.config.supervisor_interval;
            let mut ticker = time::interval_at(Instant::now() + period, period);

            loop {
                tokio::select! {
                    _ = link.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if link.state() == ConnectionState::Closed {
                            tracing::debug!("Supervisor found upstream closed");
                            link.connect();
                        }
                    }
                }
            }
        })
    }

    // ---- private helpers ----

    fn spawn_reconnect_timer(self: &Arc<Self>, delay: Duration) {
        tracing::info!(delay_ms = delay.as_millis() as u64, "Reconnecting to upstream");

        let link = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = link.cancel.cancelled() => return,
                _ = time::sleep(delay) => {}
            }
            {
                let mut inner = link.inner.lock();
                inner.backoff.advance();
                inner.reconnecting = false;
            }
            link.connect();
        });
    }

    /// Mark the link closed and hand over to the backoff timer.
    ///
    /// Also releases the `reconnecting` flag held by a failed attempt so
    /// the timer can claim it.
    fn on_disconnected(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            inner.state = ConnectionState::Closed;
            inner.outbound = None;
            inner.reconnecting = false;
        }
        if !self.cancel.is_cancelled() {
            self.schedule_reconnect();
        }
    }

    async fn run_connection(self: Arc<Self>) {
        let result = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.on_disconnected();
                return;
            }
            result = self.client.connect() => result,
        };

        let ws = match result {
            Ok(ws) => ws,
            Err(e) => {
                tracing::error!(error = %e, "Upstream connection failed");
                self.on_disconnected();
                return;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.inner.lock();
            inner.state = ConnectionState::Open;
            inner.outbound = Some(tx);
            inner.reconnecting = false;
            inner.backoff.reset();
        }
        tracing::info!(url = %self.client.url(), "Connected to upstream");

        match self.run_session(ws, rx).await {
            SessionEnd::Closed => tracing::warn!("Upstream connection closed"),
            SessionEnd::TimedOut => {
                tracing::warn!("Upstream not responding to ping, connection terminated")
            }
            SessionEnd::Error(e) => tracing::error!(error = %e, "Upstream error"),
            SessionEnd::Shutdown => tracing::info!("Upstream link shut down"),
        }

        self.on_disconnected();
    }

    /// Drive one open connection until it ends.
    ///
    /// Returning drops both halves of the socket, which is how a dead
    /// peer gets terminated without a close handshake. A write that
    /// stalls for a whole keepalive interval counts as a missed pong.
    async fn run_session(
        &self,
        ws: UpstreamStream,
        mut outbound: mpsc::UnboundedReceiver<Message>,
    ) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();
        let mut heartbeat = Heartbeat::new(self.config.keepalive_interval);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.inner.lock().state = ConnectionState::Closing;
                    let _ = write_frame(&mut sink, Message::Close(None), self.config.keepalive_interval).await;
                    return SessionEnd::Shutdown;
                }
                probe = heartbeat.tick() => match probe {
                    Probe::Expired => return SessionEnd::TimedOut,
                    Probe::Ping => {
                        let ping = Message::Ping(Vec::new());
                        if let Err(end) = write_frame(&mut sink, ping, self.config.keepalive_interval).await {
                            return end;
                        }
                    }
                },
                msg = outbound.recv() => match msg {
                    Some(msg) => {
                        if let Err(end) = write_frame(&mut sink, msg, self.config.keepalive_interval).await {
                            return end;
                        }
                    }
                    None => return SessionEnd::Error(RelayError::ChannelClosed),
                },
                frame = stream.next() => match frame {
                    Some(Ok(Message::Pong(_))) => heartbeat.record_pong(),
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(?frame, "Upstream sent close frame");
                        return SessionEnd::Closed;
                    }
                    Some(Ok(message)) => {
                        if let Some(payload) = Payload::from_message(message) {
                            if self.inbound.send(payload).is_err() {
                                tracing::debug!("Broadcast receiver gone, upstream message discarded");
                            }
                        }
                    }
                    Some(Err(e)) => return SessionEnd::Error(RelayError::Transport(e.to_string())),
                    None => return SessionEnd::Closed,
                },
            }
        }
    }
}

async fn write_frame(
    sink: &mut SplitSink<UpstreamStream, Message>,
    msg: Message,
    limit: Duration,
) -> Result<(), SessionEnd> {
    match time::timeout(limit, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(SessionEnd::Error(RelayError::Transport(e.to_string()))),
        Err(_) => Err(SessionEnd::TimedOut),
    }
}
