//! Text-frame codec.

use serde_json::Value;
use thiserror::Error;

use crate::client::ClientMessage;
use crate::server::ServerMessage;

/// Errors decoding an inbound frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Frame is not valid JSON.
    #[error("invalid JSON frame: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// Frame has no string `type` discriminator.
    #[error("message has no \"type\" field")]
    MissingType,

    /// A known message type is missing required fields or has wrong types.
    #[error("malformed {message_type} message: {source}")]
    Malformed {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors encoding an outbound message.
#[derive(Debug, Error)]
#[error("failed to encode {command} message: {source}")]
pub struct EncodeError {
    pub command: &'static str,
    #[source]
    pub source: serde_json::Error,
}

/// Decode one inbound text frame.
pub fn decode(text: &str) -> Result<ServerMessage, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(DecodeError::InvalidJson)?;
    decode_value(value)
}

/// Decode an already-parsed JSON value.
///
/// Looks at the discriminator first: unknown tags become
/// [`ServerMessage::Unknown`] instead of failing.
pub fn decode_value(value: Value) -> Result<ServerMessage, DecodeError> {
    let message_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?
        .to_string();

    if !ServerMessage::is_known_type(&message_type) {
        return Ok(ServerMessage::Unknown { message_type });
    }

    serde_json::from_value(value).map_err(|source| DecodeError::Malformed {
        message_type,
        source,
    })
}

/// Encode one outbound message as a text frame.
pub fn encode(message: &ClientMessage) -> Result<String, EncodeError> {
    serde_json::to_string(message).map_err(|source| EncodeError {
        command: message.command_name(),
        source,
    })
}
