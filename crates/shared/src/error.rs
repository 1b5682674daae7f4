//! Errors raised at the wire boundary.

use thiserror::Error;

/// A payload that could not be turned into a recognized frame, or a command
/// that could not be encoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame field `{0}` is missing")]
    MissingField(&'static str),
    #[error("frame field `{0}` must be a string")]
    NotAString(&'static str),
    #[error("broadcast event has an empty room id")]
    EmptyRoomId,
    #[error("frame matches neither a command response nor a broadcast event")]
    UnrecognizedShape,
    #[error("failed to encode command: {0}")]
    Encode(String),
}
