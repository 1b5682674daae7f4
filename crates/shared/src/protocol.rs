//! Room protocol definitions and the frame codec.
//!
//! Every frame is a JSON text message. Clients send [`OutboundCommand`]s;
//! the server answers with command responses and pushes broadcast events.
//! The two inbound shapes are told apart by their fields:
//!
//! ```text
//! CommandResponse:  { "status": "...", "room"?: "...", "code"?: "...", "message"?: "...", ... }
//! BroadcastEvent:   { "roomId": "...", "eventType": "...", "data": ... }
//! ```

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Statuses a server uses to reject a command. Anything else counts as success.
const FAILURE_STATUSES: &[&str] = &["error", "rejected", "failed", "forbidden", "denied"];

/// Opaque room key, e.g. `agents:notifications:{tenantId}:{entityId}`.
///
/// The client never looks inside it; the colon convention is only used by
/// [`RoomId::from_segments`] when building keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build a hierarchical room key by joining segments with `:`.
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = segments
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(":");
        Self(joined)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RoomId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for RoomId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for RoomId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Client command verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Join,
    Leave,
    Message,
    Claim,
    Stats,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Join => "join",
            Action::Leave => "leave",
            Action::Message => "message",
            Action::Claim => "claim",
            Action::Stats => "stats",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command sent from client to server. Built, sent, forgotten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundCommand {
    pub action: Action,
    pub room: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl OutboundCommand {
    pub fn new(action: Action, room: RoomId, data: Option<Value>) -> Self {
        Self { action, room, data }
    }

    pub fn join(room: RoomId) -> Self {
        Self::new(Action::Join, room, None)
    }

    pub fn leave(room: RoomId) -> Self {
        Self::new(Action::Leave, room, None)
    }

    pub fn message(room: RoomId, data: Value) -> Self {
        Self::new(Action::Message, room, Some(data))
    }

    pub fn claim(room: RoomId, data: Value) -> Self {
        Self::new(Action::Claim, room, Some(data))
    }

    pub fn stats(room: RoomId) -> Self {
        Self::new(Action::Stats, room, None)
    }

    /// Serialize to the JSON text sent over the wire.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

/// Server reply to a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Any additional fields the server attached (e.g. stats counters).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CommandResponse {
    pub fn new(status: impl Into<String>, room: Option<RoomId>) -> Self {
        Self {
            status: status.into(),
            room,
            code: None,
            message: None,
            extra: Map::new(),
        }
    }

    pub fn error(room: Option<RoomId>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            room,
            code: Some(code.into()),
            message: Some(message.into()),
            extra: Map::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn is_success(&self) -> bool {
        !FAILURE_STATUSES
            .iter()
            .any(|failure| self.status.eq_ignore_ascii_case(failure))
    }
}

/// Server-pushed event fanned out to every subscriber of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastEvent {
    pub room_id: RoomId,
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

impl BroadcastEvent {
    pub fn new(room_id: RoomId, event_type: impl Into<String>, data: Value) -> Self {
        Self {
            room_id,
            event_type: event_type.into(),
            data,
        }
    }
}

/// A validated inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Response(CommandResponse),
    Broadcast(BroadcastEvent),
}

impl InboundFrame {
    /// Classify an already-parsed JSON value.
    ///
    /// A frame carrying `roomId` or `eventType` is held to the broadcast
    /// shape, even if it also has a `status`. Otherwise a string `status`
    /// makes it a command response.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut map) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        if map.contains_key("roomId") || map.contains_key("eventType") {
            let room_id = take_string(&mut map, "roomId")?;
            let event_type = take_string(&mut map, "eventType")?;
            if room_id.is_empty() {
                return Err(ProtocolError::EmptyRoomId);
            }
            let data = map.remove("data").unwrap_or(Value::Null);
            return Ok(InboundFrame::Broadcast(BroadcastEvent {
                room_id: RoomId(room_id),
                event_type,
                data,
            }));
        }

        if map.contains_key("status") {
            let status = take_string(&mut map, "status")?;
            let room = take_optional_string(&mut map, "room")?.map(RoomId);
            let code = take_optional_string(&mut map, "code")?;
            let message = take_optional_string(&mut map, "message")?;
            return Ok(InboundFrame::Response(CommandResponse {
                status,
                room,
                code,
                message,
                extra: map,
            }));
        }

        Err(ProtocolError::UnrecognizedShape)
    }

    pub fn room(&self) -> Option<&RoomId> {
        match self {
            InboundFrame::Response(response) => response.room.as_ref(),
            InboundFrame::Broadcast(event) => Some(&event.room_id),
        }
    }
}

/// Decode one text frame received from the server.
pub fn decode_frame(text: &str) -> Result<InboundFrame, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    InboundFrame::from_value(value)
}

fn take_string(map: &mut Map<String, Value>, field: &'static str) -> Result<String, ProtocolError> {
    match map.remove(field) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(ProtocolError::NotAString(field)),
        None => Err(ProtocolError::MissingField(field)),
    }
}

fn take_optional_string(
    map: &mut Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, ProtocolError> {
    match map.remove(field) {
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(ProtocolError::NotAString(field)),
    }
}
