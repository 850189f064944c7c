//! Wire protocol
//!
//! Text frames exchanged with the voice endpoint. Outbound messages are fully
//! typed; inbound events only model the types the session reacts to.

use serde::{Deserialize, Serialize};

use crate::{Error, Result, codec};

/// Messages sent to the voice service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    /// Handshake sent once, right after the socket opens
    #[serde(rename = "elevenlabs.config")]
    VoiceConfig {
        /// Whether synthesized replies use the configured voice
        enabled: bool,
        /// Voice identifier
        voice_id: String,
    },

    /// One captured audio frame
    #[serde(rename = "input_audio_buffer.append")]
    AudioAppend {
        /// Base64 PCM16 payload
        audio: String,
    },
}

impl OutboundMessage {
    /// Build a frame message from raw PCM bytes
    #[must_use]
    pub fn audio(pcm: &[u8]) -> Self {
        Self::AudioAppend {
            audio: codec::encode(pcm),
        }
    }

    /// Serialize to the JSON text sent on the wire
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Nested error payload used by some upstream providers
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorDetail {
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
}

/// Events received from the voice service
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum InboundEvent {
    /// A chunk of synthesized reply audio
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        /// Base64 PCM16 at the playback sample rate
        delta: String,
    },

    /// The service finished producing the current reply
    #[serde(rename = "response.done")]
    ResponseDone,

    /// Service-side error
    #[serde(rename = "error")]
    Error {
        /// Machine-readable error code
        #[serde(default)]
        code: Option<String>,
        /// Top-level message
        #[serde(default)]
        message: Option<String>,
        /// Nested error object
        #[serde(default)]
        error: Option<ErrorDetail>,
    },

    /// Flow build progress notification
    #[serde(rename = "flow.build.progress")]
    BuildProgress {
        /// Opaque progress payload
        #[serde(default)]
        data: serde_json::Value,
    },

    /// Any event type the session does not react to
    #[serde(other)]
    Other,
}

impl InboundEvent {
    /// Parse an inbound text frame
    ///
    /// # Errors
    ///
    /// Returns `Error::Codec` if the text is not a JSON object with a `type`
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Codec(format!("invalid event: {e}")))
    }

    /// Best human-readable message of an error event
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Error {
                code,
                message,
                error,
            } => Some(
                message
                    .clone()
                    .or_else(|| error.as_ref().and_then(|e| e.message.clone()))
                    .or_else(|| code.clone())
                    .unwrap_or_else(|| "unknown service error".to_string()),
            ),
            _ => None,
        }
    }
}
