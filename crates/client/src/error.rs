//! Client-side error types.

use roomlink_shared::{Action, CommandResponse, ProtocolError, RoomId};
use thiserror::Error;

/// Why an outbound command was not written to the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("not connected; {action} for room {room} dropped")]
    NotConnected { action: Action, room: RoomId },
    #[error("connection writer closed; {action} for room {room} dropped")]
    LinkClosed { action: Action, room: RoomId },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Errors reported to a subscription's `on_error` handler.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubscriptionError {
    /// The subscription's own message handler failed.
    #[error("handler for room {room} failed: {message}")]
    Handler { room: RoomId, message: String },
    /// The server answered a command for this room with a failure status.
    #[error("command rejected for room {room}: {}", describe_rejection(.response))]
    CommandRejected { room: RoomId, response: CommandResponse },
    /// The shared connection gave up reconnecting.
    #[error("connection failed: {0}")]
    Transport(String),
}

fn describe_rejection(response: &CommandResponse) -> String {
    let mut text = response.status.clone();
    if let Some(code) = &response.code {
        text.push_str(&format!(" ({})", code));
    }
    if let Some(message) = &response.message {
        text.push_str(&format!(": {}", message));
    }
    text
}
