//! WebSocket handler for room traffic.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use roomlink_shared::{
    Action, BroadcastEvent, CommandResponse, OutboundCommand, RoomId, CHAT_CLAIMED, CHAT_MESSAGE,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub client_type: Option<String>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let client_type = params.client_type.unwrap_or_else(|| "unknown".to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, client_type, state))
}

/// Rooms joined by one connection, each with its forwarding task.
type Joined = HashMap<RoomId, JoinHandle<()>>;

async fn handle_socket(socket: WebSocket, client_type: String, state: AppState) {
    let conn_id = Uuid::new_v4();
    tracing::info!("WebSocket {} connected (clientType={})", conn_id, client_type);

    let (mut sender, mut receiver) = socket.split();
    let (forward_tx, mut forward_rx) = mpsc::unbounded_channel::<Arc<str>>();
    let mut joined: Joined = HashMap::new();

    // Task to forward frames to the WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(json) = forward_rx.recv().await {
            if sender.send(Message::text(json.as_ref())).await.is_err() {
                break;
            }
        }
    });

    // Main receive loop
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let reply = handle_command(text.as_str(), conn_id, &mut joined, &forward_tx, &state).await;
                match serde_json::to_string(&reply) {
                    Ok(json) => {
                        let _ = forward_tx.send(json.into());
                    }
                    Err(e) => tracing::error!("Failed to encode reply: {}", e),
                }
            }
            Ok(Message::Close(_)) => break,
            Err(_) => break,
            _ => {}
        }
    }

    // Cleanup
    for (room, handle) in joined.drain() {
        handle.abort();
        let _ = handle.await;
        state.release(&room).await;
    }
    send_task.abort();

    tracing::info!("WebSocket {} closed", conn_id);
}

/// Apply one client command and build the reply.
async fn handle_command(
    text: &str,
    conn_id: Uuid,
    joined: &mut Joined,
    forward_tx: &mpsc::UnboundedSender<Arc<str>>,
    state: &AppState,
) -> CommandResponse {
    let command: OutboundCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(e) => {
            tracing::debug!("Bad command from {}: {}", conn_id, e);
            return CommandResponse::error(None, "BAD_COMMAND", e.to_string());
        }
    };
    let room = command.room;
    if room.is_empty() {
        return CommandResponse::error(None, "INVALID_ROOM", "room id must not be empty");
    }

    match command.action {
        Action::Join => {
            if !joined.contains_key(&room) {
                let rx = state.join(&room).await;
                let handle = tokio::spawn(forward_room(room.clone(), rx, forward_tx.clone()));
                joined.insert(room.clone(), handle);
                tracing::debug!("{} joined room {}", conn_id, room);
            }
            CommandResponse::new("joined", Some(room))
        }
        Action::Leave => {
            if let Some(handle) = joined.remove(&room) {
                handle.abort();
                let _ = handle.await;
                state.release(&room).await;
                tracing::debug!("{} left room {}", conn_id, room);
            }
            CommandResponse::new("left", Some(room))
        }
        Action::Message => {
            let data = command.data.unwrap_or(Value::Null);
            let event_type = data
                .get("eventType")
                .and_then(Value::as_str)
                .unwrap_or(CHAT_MESSAGE)
                .to_string();
            let delivered = state
                .publish(&BroadcastEvent::new(room.clone(), event_type, data))
                .await;
            CommandResponse::new("ok", Some(room)).with_extra("delivered", json!(delivered))
        }
        Action::Claim => {
            let data = command.data.unwrap_or(Value::Null);
            let delivered = state
                .publish(&BroadcastEvent::new(room.clone(), CHAT_CLAIMED, data))
                .await;
            CommandResponse::new("ok", Some(room)).with_extra("delivered", json!(delivered))
        }
        Action::Stats => {
            let subscribers = state.subscriber_count(&room).await;
            CommandResponse::new("ok", Some(room)).with_extra("subscribers", json!(subscribers))
        }
    }
}

/// Copy a room's broadcasts into one connection's outgoing queue.
async fn forward_room(
    room: RoomId,
    mut rx: broadcast::Receiver<Arc<str>>,
    forward_tx: mpsc::UnboundedSender<Arc<str>>,
) {
    loop {
        match rx.recv().await {
            Ok(json) => {
                if forward_tx.send(json).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Subscriber of room {} lagged; skipped {} events", room, skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    tracing::debug!("Forwarding task for room {} ended", room);
}
