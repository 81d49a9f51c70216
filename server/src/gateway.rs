//! Realtime connection gateway.
//!
//! Persistent WebSocket connections are authenticated once, at handshake,
//! with the same session cookie the HTTP API uses. After the upgrade every
//! connection:
//!
//! - joins the default [`DEFAULT_ROOM`]
//! - gets a [`ConnectionRecord`] with `online = false`
//! - may `joinRoom` / `leaveRoom` any number of rooms
//! - may `message` any room, member or not
//! - may announce itself `online`
//!
//! Records are keyed by identity id, so a user who reconnects (or opens a
//! second tab) shares one record. When the last connection of a user goes
//! away the record is kept with `online = false` until an external
//! collaborator calls [`Gateway::remove_connection`].
//!
//! # Wire Format
//!
//! Frames are JSON text in both directions:
//!
//! ```json
//! {"event": "joinRoom", "data": "room1"}
//! {"event": "message", "data": {"to": "room1", "message": "hi"}}
//! {"event": "online"}
//! ```
//!
//! The server emits `message` (`{message, files?}`) and `update` (any JSON).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::http::StatusCode;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc::Receiver;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::auth::{AuthError, Identity, IdentityValidator};
use crate::rooms::{ConnectionId, RoomHub};

/// Room every connection joins on connect; target of update events.
pub const DEFAULT_ROOM: &str = "public";

/// HTTP path of the realtime endpoint.
pub const REALTIME_PATH: &str = "/connections";

// ============================================================================
// Protocol
// ============================================================================

/// A file attached to a room message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub url: String,
    pub desc: String,
}

/// Body of a `message` event as delivered to room members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMessage {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileRef>>,
}

/// Body of a client `message` event: the message plus its target room.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutgoingMessage {
    pub to: String,
    #[serde(flatten)]
    pub body: RoomMessage,
}

/// Events a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    JoinRoom(String),
    LeaveRoom(String),
    Message(OutgoingMessage),
    Online,
}

/// Events the server pushes to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    Message(RoomMessage),
    Update(Value),
}

// ============================================================================
// State
// ============================================================================

/// Per-user connection state, created on the first successful handshake.
///
/// `connection_id` is the most recent live connection of the user, or the
/// last one once every connection has closed.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionRecord {
    pub connection_id: ConnectionId,
    pub identity: Identity,
    pub rooms: HashSet<String>,
    pub online: bool,
}

/// Directory entry for a known user, keyed by identity id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub uid: String,
    pub fullname: String,
    pub short_name: String,
    #[serde(default)]
    pub online: bool,
}

/// Why a handshake was refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("origin not allowed")]
    OriginNotAllowed,

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl HandshakeError {
    /// Status code returned instead of `101 Switching Protocols`.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::OriginNotAllowed => StatusCode::FORBIDDEN,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
        }
    }

    /// Reason shown to the client. The detailed cause stays in the logs.
    #[must_use]
    pub fn client_message(&self) -> &'static str {
        match self {
            Self::OriginNotAllowed => "origin not allowed",
            Self::Auth(_) => "unauthorized",
        }
    }
}

/// Retained records plus the live connections that map onto them.
#[derive(Default)]
struct Roster {
    records: HashMap<String, ConnectionRecord>,
    live: HashMap<ConnectionId, String>,
}

impl Roster {
    fn key_of(&self, connection: ConnectionId) -> Option<String> {
        self.live.get(&connection).cloned().or_else(|| {
            self.records
                .iter()
                .find(|(_, record)| record.connection_id == connection)
                .map(|(key, _)| key.clone())
        })
    }

    fn live_for(&self, key: &str) -> Option<ConnectionId> {
        self.live
            .iter()
            .find(|(_, k)| k.as_str() == key)
            .map(|(id, _)| *id)
    }

    fn live_record_mut(&mut self, connection: ConnectionId) -> Option<&mut ConnectionRecord> {
        let key = self.live.get(&connection)?;
        self.records.get_mut(key)
    }
}

/// Roster key: the identity id, or the connection id for anonymous claims.
fn roster_key(identity: &Identity, connection: ConnectionId) -> String {
    identity
        .id()
        .map_or_else(|| connection.to_string(), str::to_string)
}

struct GatewayState {
    hub: RoomHub<ServerEvent>,
    roster: RwLock<Roster>,
    users: RwLock<HashMap<String, UserInfo>>,
    allowed_origins: HashSet<String>,
}

/// Shared handle to the realtime gateway. Cloning is cheap.
#[derive(Clone)]
pub struct Gateway {
    state: Arc<GatewayState>,
}

impl Gateway {
    /// Creates a gateway that accepts handshakes from `allowed_origins`.
    #[must_use]
    pub fn new(allowed_origins: impl IntoIterator<Item = String>) -> Self {
        Self::with_hub(allowed_origins, RoomHub::new())
    }

    /// Creates a gateway on top of an existing hub.
    #[must_use]
    pub fn with_hub(
        allowed_origins: impl IntoIterator<Item = String>,
        hub: RoomHub<ServerEvent>,
    ) -> Self {
        Self {
            state: Arc::new(GatewayState {
                hub,
                roster: RwLock::new(Roster::default()),
                users: RwLock::new(HashMap::new()),
                allowed_origins: allowed_origins.into_iter().collect(),
            }),
        }
    }

    /// Checks the origin, then the session cookie.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::OriginNotAllowed`] when the origin is
    /// missing or not allowed, or [`HandshakeError::Auth`] when the cookie
    /// does not carry a valid token.
    pub fn handshake(
        &self,
        origin: Option<&str>,
        cookie_header: Option<&str>,
        validator: &IdentityValidator,
        cookie_name: &str,
    ) -> Result<Identity, HandshakeError> {
        match origin {
            Some(origin) if self.state.allowed_origins.contains(origin) => {}
            _ => return Err(HandshakeError::OriginNotAllowed),
        }
        Ok(validator.authenticate(cookie_header, cookie_name)?)
    }

    /// Registers a newly upgraded connection.
    ///
    /// Joins it to [`DEFAULT_ROOM`] and returns its id and outbound queue.
    /// The first live connection of a user starts a fresh record with
    /// `online = false`; further ones reuse it.
    pub fn open(&self, identity: Identity) -> (ConnectionId, Receiver<ServerEvent>) {
        let connection_id = Uuid::new_v4();
        let outbox = self.state.hub.attach(connection_id);
        self.state.hub.join(connection_id, DEFAULT_ROOM);

        info!(
            connection = %connection_id,
            user = identity.id().unwrap_or("<unknown>"),
            "Realtime client connected"
        );

        let key = roster_key(&identity, connection_id);
        let mut roster = self.state.roster.write();
        let shared = if roster.live_for(&key).is_some() {
            roster.records.get_mut(&key)
        } else {
            None
        };
        if let Some(record) = shared {
            record.connection_id = connection_id;
            record.identity = identity;
            record.rooms.insert(DEFAULT_ROOM.to_string());
        } else {
            roster.records.insert(
                key.clone(),
                ConnectionRecord {
                    connection_id,
                    identity,
                    rooms: HashSet::from([DEFAULT_ROOM.to_string()]),
                    online: false,
                },
            );
        }
        roster.live.insert(connection_id, key);

        (connection_id, outbox)
    }

    /// Applies one client event. Events for a connection must be applied in
    /// arrival order; the socket loop guarantees this.
    pub fn handle_event(&self, connection: ConnectionId, event: ClientEvent) {
        match event {
            ClientEvent::JoinRoom(room) => self.join_room(connection, &room),
            ClientEvent::LeaveRoom(room) => self.leave_room(connection, &room),
            ClientEvent::Online => self.set_online(connection),
            ClientEvent::Message(OutgoingMessage { to, body }) => {
                trace!(connection = %connection, room = %to, "Client message to room");
                self.send_message_to_room(&to, body);
            }
        }
    }

    /// Marks a connection as gone. Once the user has no live connection
    /// left, the record is kept with `online = false`.
    pub fn close(&self, connection: ConnectionId) {
        self.state.hub.detach(connection);
        info!(connection = %connection, "Realtime client disconnected");

        let user_id = {
            let mut roster = self.state.roster.write();
            let Some(key) = roster.live.remove(&connection) else {
                debug!(connection = %connection, "No record for connection");
                return;
            };
            let remaining = roster.live_for(&key);
            let Some(record) = roster.records.get_mut(&key) else {
                return;
            };
            if let Some(other) = remaining {
                if record.connection_id == connection {
                    record.connection_id = other;
                }
                return;
            }
            record.online = false;
            record.identity.id().map(str::to_string)
        };

        if let Some(user_id) = user_id {
            self.set_directory_online(&user_id, false);
        }
    }

    /// Adds a connection to a room.
    pub fn join_room(&self, connection: ConnectionId, room: &str) {
        if self.state.hub.join(connection, room) {
            if let Some(record) = self.state.roster.write().live_record_mut(connection) {
                record.rooms.insert(room.to_string());
            }
            debug!(connection = %connection, room, "Joined room");
        }
    }

    /// Removes a connection from a room.
    pub fn leave_room(&self, connection: ConnectionId, room: &str) {
        if self.state.hub.leave(connection, room) {
            if let Some(record) = self.state.roster.write().live_record_mut(connection) {
                record.rooms.remove(room);
            }
            debug!(connection = %connection, room, "Left room");
        }
    }

    fn set_online(&self, connection: ConnectionId) {
        let user_id = {
            let mut roster = self.state.roster.write();
            let Some(record) = roster.live_record_mut(connection) else {
                debug!(connection = %connection, "No record for connection");
                return;
            };
            record.online = true;
            record.identity.id().map(str::to_string)
        };

        match user_id {
            Some(user_id) => self.set_directory_online(&user_id, true),
            None => debug!(connection = %connection, "Identity has no id, directory not updated"),
        }
    }

    fn set_directory_online(&self, user_id: &str, online: bool) {
        match self.state.users.write().get_mut(user_id) {
            Some(user) => user.online = online,
            None => debug!(user = %user_id, "Identity not in user directory"),
        }
    }

    /// Broadcasts a `message` event to every member of `room`.
    ///
    /// Returns the number of connections it was queued for.
    pub fn send_message_to_room(&self, room: &str, message: RoomMessage) -> usize {
        self.state.hub.emit(room, ServerEvent::Message(message))
    }

    /// Broadcasts an `update` event to the default room.
    pub fn send_update_event(&self, payload: Value) -> usize {
        self.state.hub.emit(DEFAULT_ROOM, ServerEvent::Update(payload))
    }

    /// Replaces the user directory.
    pub fn set_users(&self, users: impl IntoIterator<Item = UserInfo>) {
        let users: HashMap<String, UserInfo> =
            users.into_iter().map(|u| (u.uid.clone(), u)).collect();
        debug!(count = users.len(), "User directory replaced");
        *self.state.users.write() = users;
    }

    /// Snapshot of the user directory.
    #[must_use]
    pub fn users(&self) -> Vec<UserInfo> {
        self.state.users.read().values().cloned().collect()
    }

    #[must_use]
    pub fn user(&self, uid: &str) -> Option<UserInfo> {
        self.state.users.read().get(uid).cloned()
    }

    /// Record a connection belongs to, live or closed.
    #[must_use]
    pub fn record(&self, connection: ConnectionId) -> Option<ConnectionRecord> {
        let roster = self.state.roster.read();
        let key = roster.key_of(connection)?;
        roster.records.get(&key).cloned()
    }

    /// Record of the user with the given identity id.
    #[must_use]
    pub fn record_for(&self, user_id: &str) -> Option<ConnectionRecord> {
        self.state.roster.read().records.get(user_id).cloned()
    }

    /// Snapshot of all retained records, one per user, live or not.
    #[must_use]
    pub fn records(&self) -> Vec<ConnectionRecord> {
        self.state.roster.read().records.values().cloned().collect()
    }

    /// Drops a connection and, unless the user still has another live
    /// connection, its retained record. Returns the dropped record.
    pub fn remove_connection(&self, connection: ConnectionId) -> Option<ConnectionRecord> {
        self.state.hub.detach(connection);
        let mut roster = self.state.roster.write();
        let key = roster.key_of(connection)?;
        roster.live.remove(&connection);
        if roster.live_for(&key).is_some() {
            debug!(connection = %connection, "User still connected, record kept");
            return None;
        }
        roster.records.remove(&key)
    }

    /// Number of currently attached connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.hub.connection_count()
    }

    /// The underlying multicast hub.
    #[must_use]
    pub fn hub(&self) -> &RoomHub<ServerEvent> {
        &self.state.hub
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("hub", &self.state.hub)
            .field("records", &self.state.roster.read().records.len())
            .field("allowed_origins", &self.state.allowed_origins)
            .finish()
    }
}

// ============================================================================
// Socket loop
// ============================================================================

/// Drives one upgraded connection until the client goes away.
///
/// Outbound events are forwarded by a separate task; inbound frames are
/// applied in order on this one.
pub async fn run_connection(socket: WebSocket, gateway: Gateway, identity: Identity) {
    let (mut sender, mut receiver) = socket.split();
    let (connection_id, mut outbox) = gateway.open(identity);

    let forward_task = tokio::spawn(async move {
        while let Some(event) = outbox.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if let Err(err) = sender.send(Message::Text(json.into())).await {
                        debug!(error = %err, "Failed to send event to realtime client");
                        break;
                    }
                }
                Err(err) => {
                    error!(error = %err, "Failed to serialize server event");
                }
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientEvent>(text.as_str()) {
                Ok(event) => gateway.handle_event(connection_id, event),
                Err(err) => {
                    warn!(connection = %connection_id, error = %err, "Ignoring malformed client frame");
                }
            },
            Ok(Message::Close(_)) => {
                debug!(connection = %connection_id, "Realtime client sent close frame");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                debug!(connection = %connection_id, error = %err, "Realtime socket error");
                break;
            }
        }
    }

    forward_task.abort();
    gateway.close(connection_id);
}
