//! Room channels shared across connections.

use std::collections::HashMap;
use std::sync::Arc;

use roomlink_shared::{BroadcastEvent, RoomId};
use tokio::sync::{broadcast, RwLock};

use crate::config::ServerConfig;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    rooms: Arc<RwLock<HashMap<RoomId, broadcast::Sender<Arc<str>>>>>,
    room_capacity: usize,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            room_capacity: config.room_capacity,
        }
    }

    /// Subscribe to a room, creating its channel if needed. The receiver
    /// is taken under the map lock so a concurrent `release` cannot drop
    /// the channel between creation and subscription.
    pub async fn join(&self, room: &RoomId) -> broadcast::Receiver<Arc<str>> {
        {
            let rooms = self.rooms.read().await;
            if let Some(sender) = rooms.get(room) {
                return sender.subscribe();
            }
        }

        let mut rooms = self.rooms.write().await;
        if let Some(sender) = rooms.get(room) {
            return sender.subscribe();
        }

        let (tx, rx) = broadcast::channel(self.room_capacity);
        rooms.insert(room.clone(), tx);
        tracing::debug!("Created room {}", room);
        rx
    }

    /// Fan an event out to the room's subscribers. Returns how many
    /// connections it was queued for.
    pub async fn publish(&self, event: &BroadcastEvent) -> usize {
        let json: Arc<str> = match serde_json::to_string(event) {
            Ok(json) => json.into(),
            Err(e) => {
                tracing::error!("Failed to encode event for room {}: {}", event.room_id, e);
                return 0;
            }
        };

        let rooms = self.rooms.read().await;
        let delivered = rooms
            .get(&event.room_id)
            .map(|tx| tx.send(json).unwrap_or(0))
            .unwrap_or(0);
        tracing::debug!(
            "Published {} to room {} ({} subscribers)",
            event.event_type,
            event.room_id,
            delivered
        );
        delivered
    }

    pub async fn subscriber_count(&self, room: &RoomId) -> usize {
        self.rooms
            .read()
            .await
            .get(room)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Forget a room once nobody is subscribed to it.
    pub async fn release(&self, room: &RoomId) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(room).is_some_and(|tx| tx.receiver_count() == 0) {
            rooms.remove(room);
            tracing::debug!("Removed empty room {}", room);
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
