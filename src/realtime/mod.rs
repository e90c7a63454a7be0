//! Realtime fan-out to connected operator sockets.
//!
//! Rooms are plain strings: `org:<tenant>` for everything in a tenant,
//! `conv:<id>` for one conversation, `user:<id>` for one operator. The
//! publisher is injected through `AppState`; nothing here is global.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use diesel::prelude::*;
use futures::{sink::SinkExt, stream::StreamExt};
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

pub fn org_room(org_id: Uuid) -> String {
    format!("org:{}", org_id)
}

pub fn conv_room(conversation_id: Uuid) -> String {
    format!("conv:{}", conversation_id)
}

pub fn user_room(user_id: Uuid) -> String {
    format!("user:{}", user_id)
}

/// Event names pushed over the wire. Kept as constants so emitters and the
/// operator client agree on spelling.
pub mod events {
    pub const NEW_CONVERSATION: &str = "new-conversation";
    pub const NEW_MESSAGE: &str = "new-message";
    pub const MESSAGE_STATUS: &str = "message-status";
    pub const CONVERSATION_ASSIGNED: &str = "conversation-assigned";
    pub const CONVERSATION_TRANSFERRED: &str = "conversation-transferred";
    pub const CONVERSATION_STATUS: &str = "conversation-status-changed";
    pub const TYPING: &str = "typing";
    pub const USER_STATUS: &str = "user-status";
    pub const BROADCAST_STATUS: &str = "broadcast-status-update";
}

type SocketSender = mpsc::UnboundedSender<String>;

#[derive(Default)]
struct Rooms {
    /// room -> socket id -> sender
    members: HashMap<String, HashMap<Uuid, SocketSender>>,
    /// socket id -> rooms joined (for cheap cleanup)
    memberships: HashMap<Uuid, Vec<String>>,
}

pub struct RealtimePublisher {
    rooms: RwLock<Rooms>,
}

impl Default for RealtimePublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimePublisher {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(Rooms::default()),
        }
    }

    pub async fn join(&self, room: &str, socket_id: Uuid, tx: SocketSender) {
        let mut rooms = self.rooms.write().await;
        rooms
            .members
            .entry(room.to_string())
            .or_default()
            .insert(socket_id, tx);
        rooms
            .memberships
            .entry(socket_id)
            .or_default()
            .push(room.to_string());
    }

    pub async fn leave(&self, room: &str, socket_id: Uuid) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.members.get_mut(room) {
            members.remove(&socket_id);
            if members.is_empty() {
                rooms.members.remove(room);
            }
        }
        if let Some(joined) = rooms.memberships.get_mut(&socket_id) {
            joined.retain(|r| r != room);
        }
    }

    pub async fn disconnect(&self, socket_id: Uuid) {
        let mut rooms = self.rooms.write().await;
        if let Some(joined) = rooms.memberships.remove(&socket_id) {
            for room in joined {
                if let Some(members) = rooms.members.get_mut(&room) {
                    members.remove(&socket_id);
                    if members.is_empty() {
                        rooms.members.remove(&room);
                    }
                }
            }
        }
    }

    /// Emits an event to every socket in a room. Dead senders are dropped
    /// lazily on the next disconnect.
    pub async fn emit(&self, room: &str, event: &str, data: Value) {
        let frame = json!({ "event": event, "data": data }).to_string();
        let rooms = self.rooms.read().await;
        if let Some(members) = rooms.members.get(room) {
            for tx in members.values() {
                let _ = tx.send(frame.clone());
            }
        }
    }

    pub async fn emit_org(&self, org_id: Uuid, event: &str, data: Value) {
        self.emit(&org_room(org_id), event, data).await;
    }

    pub async fn emit_conversation(&self, conversation_id: Uuid, event: &str, data: Value) {
        self.emit(&conv_room(conversation_id), event, data).await;
    }

    pub async fn room_size(&self, room: &str) -> usize {
        self.rooms
            .read()
            .await
            .members
            .get(room)
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

// ---- websocket endpoint ----------------------------------------------------

use crate::shared::models::schema::organizations;
use crate::shared::models::Organization;
use crate::shared::state::AppState;

/// `GET /ws?api_key=...&agent_id=...`: handshake then room membership.
/// A socket only ever joins rooms inside its own tenant.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let api_key = params.get("api_key").cloned().unwrap_or_default();
    let agent_id = params
        .get("agent_id")
        .and_then(|s| Uuid::parse_str(s).ok());

    let org = match authenticate(&state, &api_key) {
        Some(org) => org,
        None => {
            return (axum::http::StatusCode::UNAUTHORIZED, "invalid credentials").into_response()
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, org, agent_id))
        .into_response()
}

fn authenticate(state: &AppState, api_key: &str) -> Option<Organization> {
    if api_key.is_empty() {
        return None;
    }
    let mut conn = state.conn.get().ok()?;
    organizations::table
        .filter(organizations::api_key.eq(api_key))
        .filter(organizations::subscription_status.eq("active"))
        .select(Organization::as_select())
        .first(&mut conn)
        .optional()
        .ok()?
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    org: Organization,
    agent_id: Option<Uuid>,
) {
    let socket_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    state
        .realtime
        .join(&org_room(org.id), socket_id, tx.clone())
        .await;
    if let Some(agent) = agent_id {
        state
            .realtime
            .join(&user_room(agent), socket_id, tx.clone())
            .await;
        state
            .realtime
            .emit_org(
                org.id,
                events::USER_STATUS,
                json!({ "agent_id": agent, "online": true }),
            )
            .await;
    }
    info!("ws connected org={} socket={}", org.id, socket_id);

    let forward = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(WsMessage::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        if let WsMessage::Text(text) = msg {
            if let Ok(value) = serde_json::from_str::<Value>(&text) {
                handle_client_frame(&state, &org, agent_id, socket_id, &tx, &value).await;
            }
        }
    }

    state.realtime.disconnect(socket_id).await;
    if let Some(agent) = agent_id {
        state
            .realtime
            .emit_org(
                org.id,
                events::USER_STATUS,
                json!({ "agent_id": agent, "online": false }),
            )
            .await;
    }
    forward.abort();
    debug!("ws disconnected org={} socket={}", org.id, socket_id);
}

async fn handle_client_frame(
    state: &Arc<AppState>,
    org: &Organization,
    agent_id: Option<Uuid>,
    socket_id: Uuid,
    tx: &SocketSender,
    frame: &Value,
) {
    let action = frame.get("action").and_then(|v| v.as_str()).unwrap_or("");
    let conversation = frame
        .get("conversation")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok());

    match (action, conversation) {
        ("join", Some(conv)) => {
            if conversation_in_org(state, org.id, conv) {
                state
                    .realtime
                    .join(&conv_room(conv), socket_id, tx.clone())
                    .await;
            } else {
                warn!("ws join refused: conv {} outside org {}", conv, org.id);
            }
        }
        ("leave", Some(conv)) => {
            state.realtime.leave(&conv_room(conv), socket_id).await;
        }
        ("typing", Some(conv)) => {
            state
                .realtime
                .emit_conversation(
                    conv,
                    events::TYPING,
                    json!({ "conversation_id": conv, "agent_id": agent_id }),
                )
                .await;
        }
        _ => {}
    }
}

fn conversation_in_org(state: &Arc<AppState>, org_id: Uuid, conversation_id: Uuid) -> bool {
    use crate::shared::models::schema::conversations;
    let Ok(mut conn) = state.conn.get() else {
        return false;
    };
    conversations::table
        .filter(conversations::id.eq(conversation_id))
        .filter(conversations::org_id.eq(org_id))
        .count()
        .get_result::<i64>(&mut conn)
        .map(|n| n > 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_reaches_only_room_members() {
        let publisher = RealtimePublisher::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let (sock_a, sock_b) = (Uuid::new_v4(), Uuid::new_v4());
        let org_a = Uuid::new_v4();
        let org_b = Uuid::new_v4();

        publisher.join(&org_room(org_a), sock_a, tx_a).await;
        publisher.join(&org_room(org_b), sock_b, tx_b).await;

        publisher
            .emit_org(org_a, events::NEW_MESSAGE, json!({"id": 1}))
            .await;

        let frame = rx_a.try_recv().expect("room member receives");
        assert!(frame.contains("new-message"));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_cleans_all_rooms() {
        let publisher = RealtimePublisher::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let sock = Uuid::new_v4();
        let org = Uuid::new_v4();
        let conv = Uuid::new_v4();

        publisher.join(&org_room(org), sock, tx.clone()).await;
        publisher.join(&conv_room(conv), sock, tx).await;
        assert_eq!(publisher.room_size(&org_room(org)).await, 1);

        publisher.disconnect(sock).await;
        assert_eq!(publisher.room_size(&org_room(org)).await, 0);
        assert_eq!(publisher.room_size(&conv_room(conv)).await, 0);
    }

    #[tokio::test]
    async fn leave_is_scoped_to_one_room() {
        let publisher = RealtimePublisher::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let sock = Uuid::new_v4();
        let conv = Uuid::new_v4();
        let org = Uuid::new_v4();

        publisher.join(&org_room(org), sock, tx.clone()).await;
        publisher.join(&conv_room(conv), sock, tx).await;
        publisher.leave(&conv_room(conv), sock).await;

        assert_eq!(publisher.room_size(&conv_room(conv)).await, 0);
        assert_eq!(publisher.room_size(&org_room(org)).await, 1);
    }
}
