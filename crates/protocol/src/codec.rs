//! Bridge codec
//!
//! Wire messages travel as JSON text. Decoding is closed per direction: a
//! payload whose `type` is not a kind of that direction is rejected, never
//! ignored.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// A message kind that can cross the channel
pub trait WireMessage: Serialize + DeserializeOwned {
    /// Literal carried in the `type` field
    fn kind(&self) -> &'static str;
}

/// Codec failures
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed message: {reason}")]
    Malformed { reason: String },

    #[error("Failed to encode {kind} message: {reason}")]
    Encode { kind: &'static str, reason: String },
}

/// Serialize a wire message to its transport payload
pub fn encode<M: WireMessage>(message: &M) -> Result<String, CodecError> {
    serde_json::to_string(message).map_err(|e| CodecError::Encode {
        kind: message.kind(),
        reason: e.to_string(),
    })
}

/// Parse a transport payload into a wire message of one direction
pub fn decode<M: WireMessage>(payload: &str) -> Result<M, CodecError> {
    serde_json::from_str(payload).map_err(|e| CodecError::Malformed {
        reason: e.to_string(),
    })
}
