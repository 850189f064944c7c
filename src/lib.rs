//! Voice Link - streaming voice client for flow-based assistants
//!
//! This library provides the core of a voice session:
//! - Microphone capture through a real-time processing stage
//! - Frame encoding for the text transport
//! - WebSocket connection lifecycle and handshake
//! - Ordered playback of synthesized replies
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 UI / CLI (SessionHandle)            │
//! │      start  │  stop  │  status  │  is_recording     │
//! └────────────────────┬────────────────────────────────┘
//!                      │ commands / watch snapshots
//! ┌────────────────────▼────────────────────────────────┐
//! │              Session Controller task                │
//! │  Capture Engine │ Connection Manager │ Playback     │
//! └──────┬──────────────────────┬───────────────────────┘
//!        │ channels             │ text frames
//! ┌──────▼──────────┐   ┌───────▼─────────────────────┐
//! │  Audio thread   │   │   Voice service (WebSocket) │
//! │ analyse/capture │   │   flow_as_tool/{flow id}    │
//! │ render          │   └─────────────────────────────┘
//! └─────────────────┘
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod session;
pub mod turns;
pub mod voice;

pub use config::Config;
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use error::{Error, Result};
pub use protocol::{InboundEvent, OutboundMessage};
pub use session::{SessionController, SessionHandle, SessionSnapshot, Status};
pub use turns::{MessageFetcher, TurnListener};
