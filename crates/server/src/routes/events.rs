//! REST entry point for pushing events into a room.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use roomlink_shared::{BroadcastEvent, CommandResponse, RoomId};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

/// `POST /api/rooms/{room}/events`
pub async fn publish_event(
    State(state): State<AppState>,
    Path(room): Path<String>,
    Json(req): Json<PublishRequest>,
) -> Result<Json<CommandResponse>, (StatusCode, Json<CommandResponse>)> {
    let room = RoomId::new(room);
    if room.is_empty() || req.event_type.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(CommandResponse::error(
                Some(room),
                "INVALID_EVENT",
                "room and eventType are required",
            )),
        ));
    }

    let event = BroadcastEvent::new(room.clone(), req.event_type, req.data);
    let delivered = state.publish(&event).await;
    tracing::info!("REST publish of {} to room {}", event.event_type, room);

    Ok(Json(
        CommandResponse::new("ok", Some(room)).with_extra("delivered", json!(delivered)),
    ))
}
