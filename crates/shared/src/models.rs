//! Known broadcast event types and their payloads.
//!
//! The router never looks at payloads. These types exist for consumers that
//! want to decode an event's `data` into something typed.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::protocol::BroadcastEvent;

pub const NEW_ESCALATION: &str = "NEW_ESCALATION";
pub const CHAT_CLAIMED: &str = "CHAT_CLAIMED";
pub const ESCALATION_UPDATED: &str = "ESCALATION_UPDATED";
pub const STATE_UPDATE: &str = "STATE_UPDATE";
pub const CHAT_MESSAGE: &str = "CHAT_MESSAGE";
pub const ERROR_EVENT: &str = "ERROR";

/// Classification of a broadcast event's `eventType`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    NewEscalation,
    ChatClaimed,
    EscalationUpdated,
    StateUpdate,
    ChatMessage,
    Error,
    Other(String),
}

impl EventKind {
    pub fn parse(event_type: &str) -> Self {
        match event_type {
            NEW_ESCALATION => EventKind::NewEscalation,
            CHAT_CLAIMED => EventKind::ChatClaimed,
            ESCALATION_UPDATED => EventKind::EscalationUpdated,
            STATE_UPDATE => EventKind::StateUpdate,
            CHAT_MESSAGE => EventKind::ChatMessage,
            ERROR_EVENT => EventKind::Error,
            other => EventKind::Other(other.to_string()),
        }
    }
}

/// Payload of a `NEW_ESCALATION` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewEscalation {
    pub escalation_id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl BroadcastEvent {
    pub fn kind(&self) -> EventKind {
        EventKind::parse(&self.event_type)
    }

    /// Decode `data` into a typed payload.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}
