//! End-to-end tests: a fake upstream, the real relay server, and real
//! WebSocket clients, all in-process on loopback ports.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream, WebSocketStream};

use fanout_core::backoff::BackoffConfig;
use fanout_core::config::RelayConfig;
use fanout_core::limiter::RateLimitConfig;
use fanout_server::relay::Relay;

type UpstreamSocket = WebSocketStream<TcpStream>;
type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn fake_upstream() -> (String, mpsc::UnboundedReceiver<(Instant, UpstreamSocket)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if let Ok(ws) = accept_async(stream).await {
                if tx.send((Instant::now(), ws)).is_err() {
                    break;
                }
            }
        }
    });

    (url, rx)
}

fn config(upstream_url: String) -> RelayConfig {
    RelayConfig {
        upstream_url,
        host: "127.0.0.1".into(),
        port: 0,
        rate_limit: RateLimitConfig::default(),
        keepalive_interval: Duration::from_secs(60),
        backoff: BackoffConfig::default(),
        supervisor_interval: Duration::from_secs(60),
        connect_timeout: Duration::from_secs(5),
    }
}

/// Serve the relay on an ephemeral port and return its WebSocket URL.
async fn serve(relay: Arc<Relay>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/", listener.local_addr().unwrap());
    let app = fanout_server::router(relay);

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    url
}

async fn connect_client(url: &str) -> ClientSocket {
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

async fn within<F: Future>(fut: F) -> F::Output {
    timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out waiting for condition")
}

async fn wait_for_clients(relay: &Relay, count: usize) {
    within(async {
        while relay.registry().client_count().await != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

fn keep_reading<S>(mut ws: WebSocketStream<S>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move { while let Some(Ok(_)) = ws.next().await {} });
}

async fn next_text<S>(ws: &mut WebSocketStream<S>) -> String
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        match within(ws.next()).await {
            Some(Ok(Message::Text(text))) => return text,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn relay_round_trip_and_upstream_reconnect() {
    let (upstream_url, mut accepted) = fake_upstream().await;
    let relay = Relay::start(&config(upstream_url));
    let url = serve(Arc::clone(&relay)).await;

    let (_, mut upstream) = within(accepted.recv()).await.unwrap();
    wait_until(|| relay.upstream().is_open()).await;

    let mut c1 = connect_client(&url).await;
    let mut c2 = connect_client(&url).await;
    wait_for_clients(&relay, 2).await;

    // Upstream -> every client.
    upstream.send(Message::Text("A".into())).await.unwrap();
    assert_eq!(next_text(&mut c1).await, "A");
    assert_eq!(next_text(&mut c2).await, "A");

    // Client -> upstream, within the limiter's first window.
    c1.send(Message::Text("B".into())).await.unwrap();
    assert_eq!(next_text(&mut upstream).await, "B");

    // Abrupt upstream loss: reconnect waits the initial backoff delay.
    let dropped_at = Instant::now();
    drop(upstream);

    let (reconnected_at, upstream) = within(accepted.recv()).await.unwrap();
    keep_reading(upstream);
    assert!(reconnected_at.duration_since(dropped_at) >= Duration::from_millis(1_000));

    wait_until(|| relay.upstream().is_open()).await;
    assert_eq!(relay.registry().client_count().await, 2);

    let stats = relay.stats();
    assert_eq!(stats.broadcast, 1);
    assert_eq!(stats.forwarded, 1);
    assert_eq!(stats.dropped, 0);
}

#[tokio::test]
async fn message_sent_while_upstream_down_is_dropped_for_good() {
    let (upstream_url, mut accepted) = fake_upstream().await;
    let relay = Relay::start(&config(upstream_url));
    let url = serve(Arc::clone(&relay)).await;

    let (_, upstream) = within(accepted.recv()).await.unwrap();
    wait_until(|| relay.upstream().is_open()).await;

    let mut client = connect_client(&url).await;
    wait_for_clients(&relay, 1).await;

    drop(upstream);
    wait_until(|| !relay.upstream().is_open()).await;

    client.send(Message::Text("lost".into())).await.unwrap();
    wait_until(|| relay.stats().dropped == 1).await;

    let (_, mut upstream) = within(accepted.recv()).await.unwrap();
    wait_until(|| relay.upstream().is_open()).await;

    client.send(Message::Text("fresh".into())).await.unwrap();
    assert_eq!(next_text(&mut upstream).await, "fresh");
    assert_eq!(relay.stats().forwarded, 1);
}

#[tokio::test]
async fn binary_frames_pass_through_unchanged() {
    let (upstream_url, mut accepted) = fake_upstream().await;
    let relay = Relay::start(&config(upstream_url));
    let url = serve(Arc::clone(&relay)).await;

    let (_, mut upstream) = within(accepted.recv()).await.unwrap();
    wait_until(|| relay.upstream().is_open()).await;

    let mut client = connect_client(&url).await;
    wait_for_clients(&relay, 1).await;

    upstream.send(Message::Binary(vec![0, 159, 146, 150])).await.unwrap();
    let frame = within(client.next()).await.unwrap().unwrap();
    assert_eq!(frame, Message::Binary(vec![0, 159, 146, 150]));

    client.send(Message::Binary(vec![1, 2])).await.unwrap();
    let frame = within(upstream.next()).await.unwrap().unwrap();
    assert_eq!(frame, Message::Binary(vec![1, 2]));
}

#[tokio::test]
async fn queued_client_messages_reach_upstream_in_order() {
    let (upstream_url, mut accepted) = fake_upstream().await;
    let relay = Relay::start(&RelayConfig {
        rate_limit: RateLimitConfig {
            limit: 2,
            window: Duration::from_millis(300),
        },
        ..config(upstream_url)
    });
    let url = serve(Arc::clone(&relay)).await;

    let (_, mut upstream) = within(accepted.recv()).await.unwrap();
    wait_until(|| relay.upstream().is_open()).await;

    let mut client = connect_client(&url).await;
    wait_for_clients(&relay, 1).await;

    for i in 0..5 {
        client.send(Message::Text(format!("m{i}"))).await.unwrap();
    }
    for i in 0..5 {
        assert_eq!(next_text(&mut upstream).await, format!("m{i}"));
    }
    assert_eq!(relay.stats().forwarded, 5);
}

#[tokio::test]
async fn unresponsive_client_is_terminated_without_affecting_others() {
    let (upstream_url, mut accepted) = fake_upstream().await;
    let relay = Relay::start(&RelayConfig {
        keepalive_interval: Duration::from_millis(150),
        ..config(upstream_url)
    });
    let url = serve(Arc::clone(&relay)).await;

    let (_, upstream) = within(accepted.recv()).await.unwrap();
    keep_reading(upstream);
    wait_until(|| relay.upstream().is_open()).await;

    // Never polled, so it never answers the relay's pings.
    let _silent = connect_client(&url).await;
    let responsive = connect_client(&url).await;
    keep_reading(responsive);
    wait_for_clients(&relay, 2).await;

    wait_for_clients(&relay, 1).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(relay.registry().client_count().await, 1);
    assert!(relay.upstream().is_open());
    assert_eq!(relay.upstream().attempts(), 1);
}

#[tokio::test]
async fn client_that_stops_reading_is_terminated_under_load() {
    let (upstream_url, mut accepted) = fake_upstream().await;
    let relay = Relay::start(&RelayConfig {
        keepalive_interval: Duration::from_millis(200),
        ..config(upstream_url)
    });
    let url = serve(Arc::clone(&relay)).await;

    let (_, mut upstream) = within(accepted.recv()).await.unwrap();
    wait_until(|| relay.upstream().is_open()).await;

    // Never polled, so its socket buffers fill under the flood.
    let _silent = connect_client(&url).await;
    wait_for_clients(&relay, 1).await;

    tokio::spawn(async move {
        let chunk = "x".repeat(256 * 1024);
        for _ in 0..200 {
            if upstream.send(Message::Text(chunk.clone())).await.is_err() {
                break;
            }
        }
        while let Some(Ok(_)) = upstream.next().await {}
    });

    wait_for_clients(&relay, 0).await;
}

#[tokio::test]
async fn shutdown_closes_clients() {
    let (upstream_url, mut accepted) = fake_upstream().await;
    let relay = Relay::start(&config(upstream_url));
    let url = serve(Arc::clone(&relay)).await;

    let (_, upstream) = within(accepted.recv()).await.unwrap();
    keep_reading(upstream);

    let mut client = connect_client(&url).await;
    wait_for_clients(&relay, 1).await;

    relay.shutdown(Duration::from_secs(2)).await;

    assert_matches!(within(client.next()).await, Some(Ok(Message::Close(_))) | None);
    assert_eq!(relay.registry().client_count().await, 0);
}
