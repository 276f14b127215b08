//! WebSocket event bus.
//!
//! Every connection is authenticated on the handshake and re-checked against
//! the session store before each inbound message and each delivery. A
//! connection whose session disappears is closed with a policy-violation
//! code and dropped from the active set.
//!
//! Outbound traffic goes through a bounded per-connection queue drained by a
//! writer task, so one slow client never holds up the fan-out to others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::events::{EventHub, Notification, PlayerEvent, StatusEvent};
use crate::models::{ConsoleLog, InstallProgress, ServerStats};
use crate::process::LifecycleManager;
use crate::session::{Session, SessionStore};
use crate::store::Store;

/// WebSocket close code for a missing, expired or revoked session.
pub const POLICY_VIOLATION: u16 = 1008;

const OUTBOUND_QUEUE: usize = 256;

const CLIENT_MESSAGE_TYPES: [&str; 3] = ["subscribe", "unsubscribe", "command:send"];

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "subscribe")]
    Subscribe {
        #[serde(rename = "serverId")]
        server_id: String,
    },
    #[serde(rename = "unsubscribe")]
    Unsubscribe {},
    #[serde(rename = "command:send")]
    CommandSend { command: String },
}

/// Validate the discriminator before decoding the variant so an unknown
/// `type` gets its own error message.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, String> {
    let value: Value = serde_json::from_str(text)
        .map_err(|_| "Malformed message: expected a JSON object".to_string())?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| "Message is missing a string 'type' field".to_string())?;
    if !CLIENT_MESSAGE_TYPES.contains(&kind) {
        return Err(format!("Unknown message type '{}'", kind));
    }
    let kind = kind.to_string();
    serde_json::from_value(value).map_err(|e| format!("Invalid '{}' message: {}", kind, e))
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "connected")]
    Connected {
        #[serde(rename = "connectionId")]
        connection_id: String,
        username: String,
    },
    #[serde(rename = "subscribed")]
    Subscribed {
        #[serde(rename = "serverId")]
        server_id: String,
    },
    #[serde(rename = "unsubscribed")]
    Unsubscribed {},
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "command:sent")]
    CommandSent {
        #[serde(rename = "serverId")]
        server_id: String,
        command: String,
    },
    #[serde(rename = "server:status")]
    Status(StatusEvent),
    #[serde(rename = "server:log")]
    Log(ConsoleLog),
    #[serde(rename = "server:stats")]
    Stats(ServerStats),
    #[serde(rename = "server:install:progress")]
    InstallProgress {
        #[serde(rename = "serverId")]
        server_id: String,
        #[serde(flatten)]
        progress: InstallProgress,
    },
    #[serde(rename = "notification")]
    Notification(Notification),
    #[serde(rename = "player:join")]
    PlayerJoin(PlayerEvent),
    #[serde(rename = "player:leave")]
    PlayerLeave(PlayerEvent),
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Server id a broadcast is scoped to; `None` for global broadcasts and
    /// direct replies.
    pub fn scope(&self) -> Option<&str> {
        match self {
            ServerMessage::Status(e) => Some(&e.server_id),
            ServerMessage::Log(l) => Some(&l.server_id),
            ServerMessage::Stats(s) => Some(&s.server_id),
            ServerMessage::InstallProgress { server_id, .. } => Some(server_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

pub struct Connection {
    pub id: String,
    pub session_id: String,
    pub username: String,
    subscription: RwLock<Option<String>>,
    tx: mpsc::Sender<String>,
    closed: watch::Sender<Option<CloseReason>>,
}

impl Connection {
    pub fn subscription(&self) -> Option<String> {
        match self.subscription.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_subscription(&self, server_id: Option<String>) {
        match self.subscription.write() {
            Ok(mut guard) => *guard = server_id,
            Err(poisoned) => *poisoned.into_inner() = server_id,
        }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    /// Mark the connection closed. The first reason wins.
    fn close(&self, code: u16, reason: &str) {
        self.closed.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(CloseReason {
                code,
                reason: reason.to_string(),
            });
            true
        });
    }

    fn reply(&self, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(text) => {
                if let Err(e) = self.tx.try_send(text) {
                    tracing::debug!("Dropped reply to connection {}: {}", self.id, e);
                }
            }
            Err(e) => tracing::error!("Failed to encode reply: {}", e),
        }
    }
}

pub struct EventBus {
    sessions: Arc<dyn SessionStore>,
    store: Arc<Store>,
    lifecycle: Arc<LifecycleManager>,
    events: EventHub,
    connections: DashMap<String, Arc<Connection>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        store: Arc<Store>,
        lifecycle: Arc<LifecycleManager>,
        events: EventHub,
    ) -> Self {
        Self {
            sessions,
            store,
            lifecycle,
            events,
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Add an authenticated connection and greet it. The receiver yields the
    /// encoded frames to write to the client.
    pub fn register(&self, session: &Session) -> (Arc<Connection>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (closed, _) = watch::channel(None);
        let id = format!("conn-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let conn = Arc::new(Connection {
            id: id.clone(),
            session_id: session.id.clone(),
            username: session.username.clone(),
            subscription: RwLock::new(None),
            tx,
            closed,
        });
        self.connections.insert(id.clone(), conn.clone());
        tracing::info!("WebSocket connection {} opened for '{}'", id, session.username);
        conn.reply(&ServerMessage::Connected {
            connection_id: id,
            username: session.username.clone(),
        });
        (conn, rx)
    }

    pub fn unregister(&self, connection_id: &str) {
        if self.connections.remove(connection_id).is_some() {
            tracing::info!("WebSocket connection {} closed", connection_id);
        }
    }

    /// Re-check the connection's session; closes and drops it when invalid.
    pub fn authorize(&self, conn: &Connection) -> bool {
        if conn.is_closed() {
            return false;
        }
        if self.sessions.get_session_by_id(&conn.session_id).is_some() {
            return true;
        }
        tracing::warn!(
            "Session for connection {} ('{}') is no longer valid; closing",
            conn.id,
            conn.username
        );
        conn.close(POLICY_VIOLATION, "Session is no longer valid");
        self.connections.remove(&conn.id);
        false
    }

    /// Handle one inbound text frame.
    pub async fn handle_text(&self, conn: &Connection, text: &str) {
        if !self.authorize(conn) {
            return;
        }
        let message = match parse_client_message(text) {
            Ok(m) => m,
            Err(e) => {
                conn.reply(&ServerMessage::error(e));
                return;
            }
        };

        match message {
            ClientMessage::Subscribe { server_id } => {
                if server_id.trim().is_empty() {
                    conn.reply(&ServerMessage::error("serverId must not be empty"));
                    return;
                }
                match self.store.get_server(&server_id) {
                    Ok(Some(_)) => {
                        conn.set_subscription(Some(server_id.clone()));
                        tracing::debug!("Connection {} subscribed to '{}'", conn.id, server_id);
                        conn.reply(&ServerMessage::Subscribed { server_id });
                    }
                    Ok(None) => {
                        conn.reply(&ServerMessage::error(format!(
                            "Server not found: {}",
                            server_id
                        )));
                    }
                    Err(e) => conn.reply(&ServerMessage::error(e.to_string())),
                }
            }
            ClientMessage::Unsubscribe {} => {
                conn.set_subscription(None);
                conn.reply(&ServerMessage::Unsubscribed {});
            }
            ClientMessage::CommandSend { command } => {
                let Some(server_id) = conn.subscription() else {
                    conn.reply(&ServerMessage::error(
                        "Subscribe to a server before sending commands",
                    ));
                    return;
                };
                match self.lifecycle.send_command(&server_id, &command).await {
                    Ok(()) => conn.reply(&ServerMessage::CommandSent { server_id, command }),
                    Err(e) => conn.reply(&ServerMessage::error(e.to_string())),
                }
            }
        }
    }

    /// Deliver one broadcast to every authorized connection in scope.
    pub fn dispatch(&self, message: &ServerMessage) {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to encode broadcast: {}", e);
                return;
            }
        };
        let scope = message.scope();
        let targets: Vec<Arc<Connection>> =
            self.connections.iter().map(|c| c.value().clone()).collect();

        for conn in targets {
            if !self.authorize(&conn) {
                continue;
            }
            if let Some(scope) = scope {
                if conn.subscription().as_deref() != Some(scope) {
                    continue;
                }
            }
            match conn.tx.try_send(text.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("Connection {} is not keeping up; dropped a message", conn.id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!("Connection {} went away during delivery", conn.id);
                    self.connections.remove(&conn.id);
                }
            }
        }
    }

    /// Start forwarding hub events to connections. Receivers are created
    /// before the task is spawned so nothing published afterwards is missed.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let mut status = self.events.status.subscribe();
        let mut log = self.events.log.subscribe();
        let mut stats = self.events.stats.subscribe();
        let mut install = self.events.install_progress.subscribe();
        let mut notification = self.events.notification.subscribe();
        let mut join = self.events.player_join.subscribe();
        let mut leave = self.events.player_leave.subscribe();

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    r = status.recv() => r.map(ServerMessage::Status),
                    r = log.recv() => r.map(ServerMessage::Log),
                    r = stats.recv() => r.map(ServerMessage::Stats),
                    r = install.recv() => r.map(|e| ServerMessage::InstallProgress {
                        server_id: e.server_id,
                        progress: e.progress,
                    }),
                    r = notification.recv() => r.map(ServerMessage::Notification),
                    r = join.recv() => r.map(ServerMessage::PlayerJoin),
                    r = leave.recv() => r.map(ServerMessage::PlayerLeave),
                };
                match next {
                    Ok(message) => self.dispatch(&message),
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Event bus lagged behind, skipped {} events", n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Drive one upgraded socket until either side closes it.
    pub async fn serve_socket(self: Arc<Self>, mut socket: WebSocket, session: Option<Session>) {
        let Some(session) = session else {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: POLICY_VIOLATION,
                    reason: "Authentication required".into(),
                })))
                .await;
            return;
        };

        let (conn, mut outbound) = self.register(&session);
        let (mut sink, mut stream) = socket.split();

        let mut writer_closed = conn.closed.subscribe();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    reason = wait_closed(&mut writer_closed) => {
                        if let Some(reason) = reason {
                            let _ = sink
                                .send(Message::Close(Some(CloseFrame {
                                    code: reason.code,
                                    reason: reason.reason.into(),
                                })))
                                .await;
                        }
                        break;
                    }
                    text = outbound.recv() => match text {
                        Some(text) => {
                            if let Err(e) = sink.send(Message::Text(text.into())).await {
                                tracing::debug!("WebSocket send failed: {}", e);
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = sink.close().await;
        });

        let mut reader_closed = conn.closed.subscribe();
        loop {
            tokio::select! {
                _ = wait_closed(&mut reader_closed) => break,
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(&conn, text.as_str()).await,
                    Some(Ok(Message::Binary(_))) => {
                        if self.authorize(&conn) {
                            conn.reply(&ServerMessage::error("Binary frames are not supported"));
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        self.authorize(&conn);
                    }
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket receive error on {}: {}", conn.id, e);
                        break;
                    }
                },
            }
        }

        self.unregister(&conn.id);
        // Last sender goes away with the connection, which ends the writer.
        drop(conn);
        let _ = writer.await;
    }
}

async fn wait_closed(rx: &mut watch::Receiver<Option<CloseReason>>) -> Option<CloseReason> {
    match rx.wait_for(Option::is_some).await {
        Ok(reason) => reason.clone(),
        Err(_) => None,
    }
}
