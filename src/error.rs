//! Error types for the voice link

use thiserror::Error;

/// Result type alias for voice link operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a voice session
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone access denied or no input device available
    #[error("{0}")]
    Permission(String),

    /// Processing module or audio graph could not be initialized
    #[error("audio init error: {0}")]
    AudioInit(String),

    /// Malformed transport text or audio payload
    #[error("codec error: {0}")]
    Codec(String),

    /// Transport-level connection failure
    #[error("connection error: {0}")]
    Connection(String),

    /// A playback segment could not be played
    #[error("playback error: {0}")]
    Playback(String),

    /// The session controller task is gone
    #[error("session error: {0}")]
    Session(String),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
