//! Bridge Codec
//!
//! JSON encoding and decoding for the gateway bridge socket. The bridge may
//! batch frames into an array or send a single object per text message.
//! Each frame in a batch decodes on its own: a malformed frame yields an
//! error entry without costing its neighbours.

use serde_json::Value;

use super::messages::{BridgeCommand, BridgeFrame};
use crate::application::ports::{GatewayMessage, TransportError};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid message format.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

impl From<CodecError> for TransportError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e.to_string())
    }
}

/// Outcome of decoding one frame.
pub type FrameResult = Result<GatewayMessage, CodecError>;

/// JSON codec for the gateway bridge.
#[derive(Debug, Default, Clone)]
pub struct BridgeCodec;

impl BridgeCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode a text message into one result per frame.
    ///
    /// Unsupported frame types are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is not a JSON array or object.
    pub fn decode(&self, text: &str) -> Result<Vec<FrameResult>, CodecError> {
        let trimmed = text.trim();

        if !trimmed.starts_with('[') && !trimmed.starts_with('{') {
            return Err(CodecError::InvalidFormat(format!(
                "expected JSON array or object, got: {}...",
                trimmed.chars().take(50).collect::<String>()
            )));
        }

        let frames = match serde_json::from_str(trimmed)? {
            Value::Array(frames) => frames,
            frame => vec![frame],
        };

        Ok(frames
            .into_iter()
            .filter_map(|frame| match serde_json::from_value::<BridgeFrame>(frame) {
                Ok(frame) => frame.into_message().map(Ok),
                Err(e) => Some(Err(e.into())),
            })
            .collect())
    }

    /// Encode a command to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode(&self, command: &BridgeCommand) -> Result<String, CodecError> {
        Ok(serde_json::to_string(command)?)
    }
}
