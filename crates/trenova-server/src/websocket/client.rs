//! One WebSocket connection and its read/write pumps.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval_at};
use trenova_core::{Pulid, id, now_unix};

use super::hub::Hub;
use super::message::{Envelope, Frame, Target};

/// Outcome of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Full,
    Closed,
}

pub struct Client {
    pub id: Pulid,
    pub user_id: Pulid,
    pub org_id: Pulid,
    pub room_id: Option<String>,
    pub remote_addr: String,
    sender: Mutex<Option<mpsc::Sender<Utf8Bytes>>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("org_id", &self.org_id)
            .field("room_id", &self.room_id)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl Client {
    /// Returns the client and the receiving end of its outbound buffer.
    /// An empty room id means no room.
    pub fn new(
        user_id: Pulid,
        org_id: Pulid,
        room_id: Option<String>,
        remote_addr: impl Into<String>,
        buffer: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Utf8Bytes>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let client = Arc::new(Self {
            id: Pulid::new(id::CONNECTION),
            user_id,
            org_id,
            room_id: room_id.filter(|room| !room.is_empty()),
            remote_addr: remote_addr.into(),
            sender: Mutex::new(Some(tx)),
        });
        (client, rx)
    }

    pub fn try_send(&self, frame: Utf8Bytes) -> SendOutcome {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return SendOutcome::Closed;
        };
        match sender.try_send(frame) {
            Ok(()) => SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Closes the outbound buffer. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        self.sender.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

/// Runs one upgraded connection to completion.
pub async fn serve(
    hub: Arc<Hub>,
    socket: WebSocket,
    client: Arc<Client>,
    rx: mpsc::Receiver<Utf8Bytes>,
) {
    hub.register(client.clone());

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(
        sink,
        rx,
        hub.config().ping_interval,
        client.id.clone(),
    ));

    read_pump(&hub, &client, stream).await;

    hub.unregister(&client);
    // the write pump only exits once the buffer is closed
    client.close();
    let _ = writer.await;
}

async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Utf8Bytes>,
    ping_interval: Duration,
    connection_id: Pulid,
) {
    let mut ticker = interval_at(tokio::time::Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                };
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    tracing::debug!(connection_id = %connection_id, error = %e, "websocket write failed");
                    return;
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = sink.send(Message::Ping(Default::default())).await {
                    tracing::debug!(connection_id = %connection_id, error = %e, "websocket ping failed");
                    return;
                }
            }
        }
    }
}

async fn read_pump(hub: &Arc<Hub>, client: &Arc<Client>, mut stream: SplitStream<WebSocket>) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => handle_inbound(hub, client, text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(connection_id = %client.id, error = %e, "websocket read failed");
                break;
            }
        }
    }
}

/// Answers pings and routes everything else onto the bus on behalf of
/// `client`.
pub(crate) async fn handle_inbound(hub: &Arc<Hub>, client: &Arc<Client>, text: &str) {
    let Ok(envelope) = serde_json::from_str::<Envelope>(text) else {
        tracing::debug!(connection_id = %client.id, "ignoring malformed websocket message");
        return;
    };

    if envelope.is_ping() {
        let pong = Frame::pong(envelope.content, now_unix());
        let Ok(encoded) = serde_json::to_string(&pong) else {
            return;
        };
        if client.try_send(encoded.into()) == SendOutcome::Full {
            tracing::warn!(
                connection_id = %client.id,
                user_id = %client.user_id,
                "send buffer full, dropping pong"
            );
        }
        return;
    }

    match envelope.target {
        Some(Target::Room) => {
            if let Some(room) = &client.room_id {
                hub.relay(client, Target::Room, room, envelope.content).await;
            }
        }
        Some(Target::Org) => {
            hub.relay(client, Target::Org, client.org_id.as_str(), envelope.content)
                .await;
        }
        Some(Target::User) => {
            if envelope.target_id.is_empty() {
                return;
            }
            match Pulid::parse(&envelope.target_id) {
                Ok(user_id) => {
                    hub.relay(client, Target::User, user_id.as_str(), envelope.content)
                        .await;
                }
                Err(e) => tracing::debug!(
                    connection_id = %client.id,
                    target_id = %envelope.target_id,
                    error = %e,
                    "ignoring message for malformed user id"
                ),
            }
        }
        None => {}
    }
}
