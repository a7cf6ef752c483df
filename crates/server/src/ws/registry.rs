use std::collections::HashMap;
use std::net::SocketAddr;

use axum::extract::ws::Message;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use fanout_core::types::{ClientId, ConnectionState, Payload, Timestamp};

/// Channel sender half for pushing frames to a client's socket task.
pub type ClientSender = mpsc::UnboundedSender<Message>;

/// Bookkeeping for a single downstream client.
pub struct ClientEntry {
    /// Peer address, when the listener exposes it.
    remote_addr: Option<SocketAddr>,
    state: ConnectionState,
    /// Channel sender for outbound frames to this client.
    sender: ClientSender,
    connected_at: Timestamp,
    /// Stops the client's session task (and with it, its heartbeat).
    cancel: CancellationToken,
}

impl ClientEntry {
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connected_at(&self) -> Timestamp {
        self.connected_at
    }
}

/// The set of currently connected downstream clients.
///
/// Thread-safe via interior `RwLock`; shared as `Arc<ClientRegistry>`.
/// Each entry is driven by its own session task, so terminating one
/// client never touches another.
pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, ClientEntry>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Register a freshly accepted client in the `Open` state.
    ///
    /// Returns the receiver the session task drains into the socket.
    /// `cancel` is fired by [`terminate`](Self::terminate).
    pub async fn add(
        &self,
        client_id: ClientId,
        remote_addr: Option<SocketAddr>,
        cancel: CancellationToken,
    ) -> mpsc::UnboundedReceiver<Message> {
        let (sender, rx) = mpsc::unbounded_channel();
        let entry = ClientEntry {
            remote_addr,
            state: ConnectionState::Open,
            sender,
            connected_at: chrono::Utc::now(),
            cancel,
        };
        self.clients.write().await.insert(client_id, entry);
        rx
    }

    /// Remove a client, returning its entry if it was registered.
    pub async fn remove(&self, client_id: &ClientId) -> Option<ClientEntry> {
        self.clients.write().await.remove(client_id)
    }

    /// Update a client's connection state.
    pub async fn set_state(&self, client_id: &ClientId, state: ConnectionState) -> bool {
        match self.clients.write().await.get_mut(client_id) {
            Some(entry) => {
                entry.state = state;
                true
            }
            None => false,
        }
    }

    pub async fn state(&self, client_id: &ClientId) -> Option<ConnectionState> {
        self.clients.read().await.get(client_id).map(|entry| entry.state)
    }

    /// Send `payload` to every client that is currently `Open`.
    ///
    /// Clients in any other state, and clients whose session task has
    /// already gone, are skipped silently. Returns the number of clients
    /// the frame was handed to.
    pub async fn broadcast(&self, payload: Payload) -> usize {
        let message = into_message(payload);
        let clients = self.clients.read().await;
        let mut delivered = 0;
        for entry in clients.values() {
            if !entry.state.is_open() {
                continue;
            }
            if entry.sender.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Mark a client as closing and stop its session task.
    pub async fn terminate(&self, client_id: &ClientId) -> bool {
        match self.clients.write().await.get_mut(client_id) {
            Some(entry) => {
                entry.state = ConnectionState::Closing;
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop every session task and clear the registry.
    pub async fn shutdown_all(&self) {
        let mut clients = self.clients.write().await;
        let count = clients.len();
        for entry in clients.values() {
            entry.cancel.cancel();
        }
        clients.clear();
        tracing::info!(count, "Closed all client connections");
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a relayed payload into an axum frame of the same kind.
pub fn into_message(payload: Payload) -> Message {
    match payload {
        Payload::Text(text) => Message::Text(text.into()),
        Payload::Binary(data) => Message::Binary(data.into()),
    }
}

/// Extract the relayable payload from an axum frame.
pub fn into_payload(message: Message) -> Option<Payload> {
    match message {
        Message::Text(text) => Some(Payload::Text(text.as_str().to_owned())),
        Message::Binary(data) => Some(Payload::Binary(data.to_vec())),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => None,
    }
}
