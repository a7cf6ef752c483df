use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};

use fanout_core::heartbeat::{Heartbeat, Probe};
use fanout_core::types::{ClientId, ConnectionState};

use crate::relay::{ForwardOutcome, Relay};
use crate::state::AppState;
use crate::ws::registry::{into_payload, ClientRegistry};

/// HTTP handler that upgrades any request path to a relay client socket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, remote_addr, state.relay))
}

/// Drive a single client connection after upgrade.
///
/// One loop owns the socket and multiplexes four event sources in
/// arrival order:
///   1. registry shutdown / termination,
///   2. heartbeat ticks (ping, or terminate on a missed pong),
///   3. broadcast frames queued by the registry,
///   4. inbound frames, forwarded upstream through the relay.
///
/// Every write is bounded by the keepalive interval. A client that stops
/// reading is terminated just like one that stops answering pings.
async fn handle_socket(socket: WebSocket, remote_addr: SocketAddr, relay: Arc<Relay>) {
    let client_id = ClientId::new();
    let registry = Arc::clone(relay.registry());
    let cancel = relay.shutdown_token().child_token();

    let mut outbound = registry
        .add(client_id, Some(remote_addr), cancel.clone())
        .await;
    tracing::info!(%client_id, %remote_addr, "Client connected");

    let (mut sink, mut stream) = socket.split();
    let keepalive = relay.keepalive_interval();
    let mut heartbeat = Heartbeat::new(keepalive);

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write_frame(&mut sink, Message::Close(None), keepalive).await;
                break "terminated";
            }
            probe = heartbeat.tick() => match probe {
                Probe::Expired => {
                    tracing::warn!(%client_id, %remote_addr, "Client did not respond to ping, closing");
                    registry.terminate(&client_id).await;
                    break "liveness timeout";
                }
                Probe::Ping => {
                    if let Err(failure) = write_frame(&mut sink, Message::Ping(Bytes::new()), keepalive).await {
                        break on_write_failure(&registry, &client_id, failure).await;
                    }
                }
            },
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    if let Err(failure) = write_frame(&mut sink, msg, keepalive).await {
                        break on_write_failure(&registry, &client_id, failure).await;
                    }
                }
                None => break "removed",
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Pong(_))) => heartbeat.record_pong(),
                Some(Ok(Message::Close(_))) | None => break "closed by peer",
                Some(Ok(message)) => {
                    if let Some(payload) = into_payload(message) {
                        tracing::trace!(%client_id, bytes = payload.len(), "Client message received");
                        // The send itself is not awaited; the relay counts and logs it.
                        if let ForwardOutcome::Dropped = relay.forward(payload) {
                            tracing::debug!(%client_id, "Client message dropped, upstream down");
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!(%client_id, error = %e, "Client receive error");
                    break "receive error";
                }
            },
        }
    };

    registry.set_state(&client_id, ConnectionState::Closing).await;
    let connected_secs = registry
        .remove(&client_id)
        .await
        .map(|entry| (chrono::Utc::now() - entry.connected_at()).num_seconds());
    tracing::info!(%client_id, %remote_addr, reason, ?connected_secs, "Client disconnected");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteFailure {
    /// The socket reported an error.
    Closed,
    /// The peer stopped draining its socket.
    Stalled,
}

/// Write one frame, giving up after `limit`.
async fn write_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    msg: Message,
    limit: Duration,
) -> Result<(), WriteFailure> {
    match tokio::time::timeout(limit, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(WriteFailure::Closed),
        Err(_) => Err(WriteFailure::Stalled),
    }
}

async fn on_write_failure(
    registry: &ClientRegistry,
    client_id: &ClientId,
    failure: WriteFailure,
) -> &'static str {
    match failure {
        WriteFailure::Closed => "send failed",
        WriteFailure::Stalled => {
            tracing::warn!(%client_id, "Client stopped reading, closing");
            registry.terminate(client_id).await;
            "write stalled"
        }
    }
}
