//! Local client registry and cross-node fan-out.
//!
//! ## Flow
//!
//! ```text
//! broadcast_to_*  ──► local clients (try_send, slow consumers dropped)
//!                 └─► PUBLISH broadcast:<target>:<id>  {serverID = self}
//!
//! PSUBSCRIBE broadcast:*  ──► remote queue ──► control loop
//!                              (own serverID discarded, others delivered locally)
//! ```
//!
//! Index mutations happen on the control loop; presence writes to the cache
//! happen on a separate worker so the loop never waits on I/O.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::ws::Utf8Bytes;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use trenova_cache::{CacheResult, CacheStore, PubSubMessage};
use trenova_core::{Pulid, id, now_unix};

use super::client::{Client, SendOutcome};
use super::message::{CHANNEL_PATTERN, Envelope, Frame, TYPE_NOTIFICATION, Target};
use crate::config::WebSocketConfig;

pub fn user_connections_key(user_id: &str) -> String {
    format!("user:{user_id}:connections")
}

pub fn org_clients_key(org_id: &str) -> String {
    format!("org:{org_id}:clients")
}

pub fn room_users_key(room_id: &str) -> String {
    format!("room:{room_id}:users")
}

#[derive(Default)]
struct Indices {
    clients: HashMap<Pulid, Arc<Client>>,
    users: HashMap<String, HashSet<Pulid>>,
    orgs: HashMap<String, HashSet<Pulid>>,
    rooms: HashMap<String, HashSet<Pulid>>,
}

impl Indices {
    fn insert(&mut self, client: Arc<Client>) {
        let id = client.id.clone();
        self.users
            .entry(client.user_id.to_string())
            .or_default()
            .insert(id.clone());
        self.orgs
            .entry(client.org_id.to_string())
            .or_default()
            .insert(id.clone());
        if let Some(room) = &client.room_id {
            self.rooms.entry(room.clone()).or_default().insert(id.clone());
        }
        self.clients.insert(id, client);
    }

    fn remove(&mut self, client_id: &Pulid) -> Option<Arc<Client>> {
        let client = self.clients.remove(client_id)?;
        remove_member(&mut self.users, client.user_id.as_str(), client_id);
        remove_member(&mut self.orgs, client.org_id.as_str(), client_id);
        if let Some(room) = &client.room_id {
            remove_member(&mut self.rooms, room, client_id);
        }
        Some(client)
    }

    fn lookup(&self, target: Target, target_id: &str) -> Option<&HashSet<Pulid>> {
        match target {
            Target::User => self.users.get(target_id),
            Target::Org => self.orgs.get(target_id),
            Target::Room => self.rooms.get(target_id),
        }
    }

    /// Whether `user_id` still has a client matching `pred`.
    fn user_has(&self, user_id: &str, pred: impl Fn(&Client) -> bool) -> bool {
        self.users.get(user_id).is_some_and(|ids| {
            ids.iter()
                .filter_map(|id| self.clients.get(id))
                .any(|c| pred(c.as_ref()))
        })
    }

    fn left(&self, client: &Client) -> Presence {
        let user = client.user_id.as_str();
        Presence::Left {
            user_id: client.user_id.to_string(),
            org_id: client.org_id.to_string(),
            room_id: client.room_id.clone(),
            remote_addr: client.remote_addr.clone(),
            still_in_org: self.user_has(user, |c| c.org_id == client.org_id),
            still_in_room: client
                .room_id
                .as_ref()
                .is_some_and(|room| self.user_has(user, |c| c.room_id.as_ref() == Some(room))),
        }
    }
}

fn remove_member(index: &mut HashMap<String, HashSet<Pulid>>, key: &str, client_id: &Pulid) {
    if let Some(ids) = index.get_mut(key) {
        ids.remove(client_id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

enum Command {
    Register(Arc<Client>),
    Unregister(Pulid),
}

#[derive(Debug)]
enum Presence {
    Joined {
        user_id: String,
        org_id: String,
        room_id: Option<String>,
        remote_addr: String,
    },
    Left {
        user_id: String,
        org_id: String,
        room_id: Option<String>,
        remote_addr: String,
        still_in_org: bool,
        still_in_room: bool,
    },
}

struct Receivers {
    control: mpsc::UnboundedReceiver<Command>,
    presence: mpsc::UnboundedReceiver<Presence>,
    remote: mpsc::Receiver<Envelope>,
}

pub struct Hub {
    server_id: Pulid,
    cache: Arc<dyn CacheStore>,
    config: WebSocketConfig,
    indices: RwLock<Indices>,
    control_tx: mpsc::UnboundedSender<Command>,
    presence_tx: mpsc::UnboundedSender<Presence>,
    remote_tx: mpsc::Sender<Envelope>,
    receivers: Mutex<Option<Receivers>>,
    subscribed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    /// Creates a hub with a fresh `srv_` identity. Call [`Hub::start`]
    /// before serving connections.
    pub fn new(cache: Arc<dyn CacheStore>, config: WebSocketConfig) -> Arc<Self> {
        let (control_tx, control) = mpsc::unbounded_channel();
        let (presence_tx, presence) = mpsc::unbounded_channel();
        let (remote_tx, remote) = mpsc::channel(config.broadcast_buffer.max(1));
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            server_id: Pulid::new(id::SERVER),
            cache,
            config,
            indices: RwLock::new(Indices::default()),
            control_tx,
            presence_tx,
            remote_tx,
            receivers: Mutex::new(Some(Receivers {
                control,
                presence,
                remote,
            })),
            subscribed: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn server_id(&self) -> &Pulid {
        &self.server_id
    }

    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    /// Spawns the control loop, presence worker and pub/sub subscriber.
    pub fn start(self: &Arc<Self>) {
        let Some(receivers) = self.receivers.lock().take() else {
            tracing::warn!(server_id = %self.server_id, "websocket hub already started");
            return;
        };

        let handles = vec![
            tokio::spawn(
                self.clone()
                    .run_control(receivers.control, receivers.remote, self.shutdown_tx.subscribe()),
            ),
            tokio::spawn(
                self.clone()
                    .run_presence(receivers.presence, self.shutdown_tx.subscribe()),
            ),
            tokio::spawn(self.clone().run_subscriber(self.shutdown_tx.subscribe())),
        ];
        self.tasks.lock().extend(handles);

        tracing::info!(server_id = %self.server_id, "websocket hub started");
    }

    /// Disconnects every local client and stops the background tasks.
    pub async fn shutdown(&self) {
        let disconnected = self.disconnect_all();
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!(
            server_id = %self.server_id,
            disconnected,
            "websocket hub stopped"
        );
    }

    pub fn register(&self, client: Arc<Client>) {
        if self.control_tx.send(Command::Register(client)).is_err() {
            tracing::warn!(server_id = %self.server_id, "websocket hub is not running");
        }
    }

    /// Safe to call more than once for the same client.
    pub fn unregister(&self, client: &Client) {
        let _ = self.control_tx.send(Command::Unregister(client.id.clone()));
    }

    /// Closes every local client. Returns how many were connected.
    pub fn disconnect_all(&self) -> usize {
        let mut indices = self.indices.write();
        let ids: Vec<Pulid> = indices.clients.keys().cloned().collect();
        for client_id in &ids {
            if let Some(client) = indices.remove(client_id) {
                client.close();
                let _ = self.presence_tx.send(indices.left(&client));
            }
        }
        ids.len()
    }

    pub async fn broadcast_to_user(&self, user_id: &Pulid, content: Value) {
        self.broadcast(Target::User, user_id.as_str(), content, None).await;
    }

    pub async fn broadcast_to_org(&self, org_id: &Pulid, content: Value) {
        self.broadcast(Target::Org, org_id.as_str(), content, None).await;
    }

    pub async fn broadcast_to_room(&self, room_id: &str, content: Value) {
        self.broadcast(Target::Room, room_id, content, None).await;
    }

    /// Fans out a message written by `sender`. The published envelope is
    /// stamped with the sender's user and organization.
    pub(crate) async fn relay(
        &self,
        sender: &Client,
        target: Target,
        target_id: &str,
        content: Value,
    ) {
        self.broadcast(target, target_id, content, Some(sender)).await;
    }

    async fn broadcast(
        &self,
        target: Target,
        target_id: &str,
        content: Value,
        sender: Option<&Client>,
    ) {
        self.deliver_local(target, target_id, &content);

        let envelope = Envelope {
            kind: TYPE_NOTIFICATION.to_string(),
            target: Some(target),
            target_id: target_id.to_string(),
            user_id: sender.map(|c| c.user_id.to_string()),
            org_id: sender.map(|c| c.org_id.to_string()),
            server_id: Some(self.server_id.to_string()),
            content,
        };
        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode broadcast envelope");
                return;
            }
        };
        let channel = target.channel(target_id);
        if let Err(e) = self.cache.publish(&channel, &payload).await {
            tracing::warn!(
                server_id = %self.server_id,
                channel = %channel,
                error = %e,
                "cross-node publish skipped"
            );
        }
    }

    /// Sends a notification frame to every local client on the target.
    /// Returns the number of clients that accepted it.
    fn deliver_local(&self, target: Target, target_id: &str, content: &Value) -> usize {
        let mut delivered = 0;
        let mut slow = Vec::new();
        {
            let indices = self.indices.read();
            let Some(ids) = indices.lookup(target, target_id) else {
                return 0;
            };
            let frame = Frame::notification(content.clone(), now_unix());
            let encoded: Utf8Bytes = match serde_json::to_string(&frame) {
                Ok(encoded) => encoded.into(),
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode notification frame");
                    return 0;
                }
            };
            for client in ids.iter().filter_map(|id| indices.clients.get(id)) {
                match client.try_send(encoded.clone()) {
                    SendOutcome::Sent => delivered += 1,
                    SendOutcome::Full => slow.push(client.clone()),
                    SendOutcome::Closed => {}
                }
            }
        }

        for client in slow {
            tracing::warn!(
                connection_id = %client.id,
                user_id = %client.user_id,
                "send buffer full, dropping slow consumer"
            );
            self.unregister(&client);
        }
        delivered
    }

    async fn run_control(
        self: Arc<Self>,
        mut control: mpsc::UnboundedReceiver<Command>,
        mut remote: mpsc::Receiver<Envelope>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                command = control.recv() => match command {
                    Some(Command::Register(client)) => self.install(client),
                    Some(Command::Unregister(client_id)) => self.uninstall(&client_id),
                    None => return,
                },
                Some(envelope) = remote.recv() => self.handle_remote(envelope),
                _ = shutdown.changed() => return,
            }
        }
    }

    fn install(&self, client: Arc<Client>) {
        if client.is_closed() {
            return;
        }
        tracing::info!(
            server_id = %self.server_id,
            connection_id = %client.id,
            user_id = %client.user_id,
            org_id = %client.org_id,
            room_id = client.room_id.as_deref().unwrap_or_default(),
            "websocket client registered"
        );
        let _ = self.presence_tx.send(Presence::Joined {
            user_id: client.user_id.to_string(),
            org_id: client.org_id.to_string(),
            room_id: client.room_id.clone(),
            remote_addr: client.remote_addr.clone(),
        });
        self.indices.write().insert(client);
    }

    fn uninstall(&self, client_id: &Pulid) {
        let mut indices = self.indices.write();
        let Some(client) = indices.remove(client_id) else {
            return;
        };
        client.close();
        let _ = self.presence_tx.send(indices.left(&client));
        drop(indices);

        tracing::info!(
            server_id = %self.server_id,
            connection_id = %client.id,
            user_id = %client.user_id,
            org_id = %client.org_id,
            "websocket client unregistered"
        );
    }

    fn handle_remote(&self, envelope: Envelope) {
        if envelope.server_id.as_deref() == Some(self.server_id.as_str()) {
            tracing::debug!(
                server_id = %self.server_id,
                target_id = %envelope.target_id,
                "ignoring own broadcast"
            );
            return;
        }
        let Some(target) = envelope.target else {
            return;
        };
        self.deliver_local(target, &envelope.target_id, &envelope.content);
    }

    async fn run_presence(
        self: Arc<Self>,
        mut ops: mpsc::UnboundedReceiver<Presence>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                op = ops.recv() => match op {
                    Some(op) => self.apply_presence(op).await,
                    None => return,
                },
                _ = shutdown.changed() => {
                    while let Ok(op) = ops.try_recv() {
                        self.apply_presence(op).await;
                    }
                    return;
                }
            }
        }
    }

    async fn apply_presence(&self, op: Presence) {
        let result: CacheResult<()> = async {
            match &op {
                Presence::Joined {
                    user_id,
                    org_id,
                    room_id,
                    remote_addr,
                } => {
                    self.cache
                        .sadd(&user_connections_key(user_id), remote_addr)
                        .await?;
                    self.cache.sadd(&org_clients_key(org_id), user_id).await?;
                    if let Some(room) = room_id {
                        self.cache.sadd(&room_users_key(room), user_id).await?;
                    }
                }
                Presence::Left {
                    user_id,
                    org_id,
                    room_id,
                    remote_addr,
                    still_in_org,
                    still_in_room,
                } => {
                    self.cache
                        .srem(&user_connections_key(user_id), remote_addr)
                        .await?;
                    if !still_in_org {
                        self.cache.srem(&org_clients_key(org_id), user_id).await?;
                    }
                    if let Some(room) = room_id
                        && !still_in_room
                    {
                        self.cache.srem(&room_users_key(room), user_id).await?;
                    }
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(server_id = %self.server_id, error = %e, presence = ?op, "presence update failed");
        }
    }

    async fn run_subscriber(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = self.config.resubscribe_initial;
        let patterns = [CHANNEL_PATTERN.to_string()];

        loop {
            match self.cache.psubscribe(&patterns).await {
                Ok(mut stream) => {
                    backoff = self.config.resubscribe_initial;
                    self.subscribed.store(true, Ordering::SeqCst);
                    tracing::info!(server_id = %self.server_id, pattern = CHANNEL_PATTERN, "subscribed to broadcasts");

                    loop {
                        tokio::select! {
                            message = stream.next() => match message {
                                Some(message) => self.forward_remote(message).await,
                                None => break,
                            },
                            _ = shutdown.changed() => {
                                self.subscribed.store(false, Ordering::SeqCst);
                                return;
                            }
                        }
                    }

                    self.subscribed.store(false, Ordering::SeqCst);
                    tracing::warn!(
                        server_id = %self.server_id,
                        backoff_secs = backoff.as_secs_f64(),
                        "broadcast subscription ended, resubscribing"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        server_id = %self.server_id,
                        error = %e,
                        backoff_secs = backoff.as_secs_f64(),
                        "broadcast subscription failed, retrying"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => return,
            }
            backoff = (backoff * 2).min(self.config.resubscribe_max);
        }
    }

    async fn forward_remote(&self, message: PubSubMessage) {
        match serde_json::from_slice::<Envelope>(&message.payload) {
            Ok(envelope) => {
                let _ = self.remote_tx.send(envelope).await;
            }
            Err(e) => tracing::debug!(
                channel = %message.channel,
                error = %e,
                "ignoring malformed broadcast"
            ),
        }
    }

    pub async fn org_members(&self, org_id: &Pulid) -> CacheResult<Vec<String>> {
        self.cache.smembers(&org_clients_key(org_id.as_str())).await
    }

    pub async fn room_members(&self, room_id: &str) -> CacheResult<Vec<String>> {
        self.cache.smembers(&room_users_key(room_id)).await
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    pub fn client_count(&self) -> usize {
        self.indices.read().clients.len()
    }

    pub fn user_connection_count(&self, user_id: &Pulid) -> usize {
        self.count(Target::User, user_id.as_str())
    }

    pub fn org_connection_count(&self, org_id: &Pulid) -> usize {
        self.count(Target::Org, org_id.as_str())
    }

    pub fn room_connection_count(&self, room_id: &str) -> usize {
        self.count(Target::Room, room_id)
    }

    fn count(&self, target: Target, target_id: &str) -> usize {
        self.indices
            .read()
            .lookup(target, target_id)
            .map_or(0, HashSet::len)
    }
}
