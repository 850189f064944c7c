//! Connection manager
//!
//! Owns one WebSocket connection to the voice service: connect, handshake,
//! outbound frames, inbound dispatch and close. Socket tasks report back over
//! a channel; the owner feeds each [`TransportEvent`] to [`ConnectionManager::apply`]
//! from its own task so every state transition happens in one place.
//!
//! Nothing here awaits socket I/O. Outbound text goes through a bounded queue
//! drained by a writer task, so a peer that stops reading can never stall the
//! owner.

use std::fmt;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::OutboundMessage;
use crate::voice::Frame;
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Close code reported when the peer sent a close frame without a status
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Close code reported when the socket ended without a closing handshake
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Outbound messages buffered ahead of the writer task
pub const OUTBOUND_CAPACITY: usize = 64;

/// How long a released writer may keep flushing before it is aborted
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never opened
    Idle,
    /// Connect in flight
    Connecting,
    /// Handshake sent, frames flow
    Open,
    /// Local close in progress
    Closing,
    /// Transport failure being handled
    Erroring,
    /// Finished; a new `open` may follow
    Closed,
}

/// Events surfaced to the session controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Connected and handshake sent
    Opened,
    /// Inbound text frame, uninterpreted
    Message(String),
    /// Connection closed with a code
    Closed {
        /// Close code, passed through verbatim
        code: u16,
    },
    /// Transport failure; the connection is closed
    Error(String),
}

enum Transport {
    Connected(Box<WsStream>),
    Message(String),
    Closed(u16),
    Failed(String),
}

/// Raw report from a socket task, tagged with the connection it belongs to
pub struct TransportEvent {
    generation: u64,
    transport: Transport,
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.transport {
            Transport::Connected(_) => "connected",
            Transport::Message(_) => "message",
            Transport::Closed(_) => "closed",
            Transport::Failed(_) => "failed",
        };
        f.debug_struct("TransportEvent")
            .field("generation", &self.generation)
            .field("kind", &kind)
            .finish()
    }
}

struct Writer {
    outbound: mpsc::Sender<Message>,
    task: JoinHandle<()>,
}

/// Owns the lifecycle of a single voice connection
pub struct ConnectionManager {
    handshake: OutboundMessage,
    api_key: Option<String>,
    state: ConnectionState,
    generation: u64,
    writer: Option<Writer>,
    connector: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    last_close_code: Option<u16>,
    last_error: Option<String>,
    frames_sent: u64,
    frames_dropped: u64,
}

impl ConnectionManager {
    /// Create a manager that sends `handshake` right after each open
    #[must_use]
    pub fn new(handshake: OutboundMessage) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            handshake,
            api_key: None,
            state: ConnectionState::Idle,
            generation: 0,
            writer: None,
            connector: None,
            reader: None,
            events_tx,
            events_rx,
            last_close_code: None,
            last_error: None,
            frames_sent: 0,
            frames_dropped: 0,
        }
    }

    /// Send `x-api-key` with the upgrade request
    #[must_use]
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    /// Start connecting to `url`
    ///
    /// Ignored unless the connection is idle or closed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connection` if the URL cannot form an upgrade request
    pub fn open(&mut self, url: &str) -> Result<()> {
        if !matches!(self.state, ConnectionState::Idle | ConnectionState::Closed) {
            tracing::debug!(state = ?self.state, "open ignored, connection already active");
            return Ok(());
        }

        let mut request = url
            .into_client_request()
            .map_err(|e| Error::Connection(format!("invalid voice url: {e}")))?;
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(key)
                .map_err(|e| Error::Connection(format!("invalid api key header: {e}")))?;
            request.headers_mut().insert("x-api-key", value);
        }

        self.generation += 1;
        self.state = ConnectionState::Connecting;
        self.last_close_code = None;
        self.last_error = None;

        let generation = self.generation;
        let events = self.events_tx.clone();
        tracing::info!(url, "connecting to voice service");

        self.connector = Some(tokio::spawn(async move {
            let transport = match tokio_tungstenite::connect_async(request).await {
                Ok((stream, _)) => Transport::Connected(Box::new(stream)),
                Err(e) => Transport::Failed(e.to_string()),
            };
            let _ = events.send(TransportEvent {
                generation,
                transport,
            });
        }));

        Ok(())
    }

    /// Wait for the next report from the socket tasks
    ///
    /// Cancel-safe; pass the result to [`Self::apply`].
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.events_rx.recv().await
    }

    /// Apply a socket report and return the event it produces, if any
    ///
    /// Reports from a previous connection are discarded.
    pub fn apply(&mut self, event: TransportEvent) -> Option<ConnectionEvent> {
        if event.generation != self.generation {
            tracing::trace!(
                generation = event.generation,
                current = self.generation,
                "discarding stale transport event"
            );
            return None;
        }

        match event.transport {
            Transport::Connected(stream) => Some(self.on_connected(*stream)),
            Transport::Message(text) => {
                (self.state == ConnectionState::Open).then_some(ConnectionEvent::Message(text))
            }
            Transport::Closed(code) => {
                tracing::info!(code, "voice connection closed");
                self.release();
                self.last_close_code = Some(code);
                self.state = ConnectionState::Closed;
                Some(ConnectionEvent::Closed { code })
            }
            Transport::Failed(reason) => Some(self.fail(reason)),
        }
    }

    fn on_connected(&mut self, stream: WsStream) -> ConnectionEvent {
        self.connector = None;
        let (sink, stream) = stream.split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

        self.writer = Some(Writer {
            outbound,
            task: tokio::spawn(write_loop(
                sink,
                outbound_rx,
                self.generation,
                self.events_tx.clone(),
            )),
        });
        self.reader = Some(tokio::spawn(read_loop(
            stream,
            self.generation,
            self.events_tx.clone(),
        )));
        self.state = ConnectionState::Open;

        // First message on a fresh queue, so it always fits and always leads
        let queued = self
            .handshake
            .to_json()
            .map_err(|e| e.to_string())
            .and_then(|json| self.queue(Message::Text(json)).map_err(|e| e.to_string()));
        if let Err(reason) = queued {
            return self.fail(reason);
        }

        tracing::info!("voice connection open, handshake sent");
        ConnectionEvent::Opened
    }

    /// Queue one captured frame for sending
    ///
    /// Returns `Ok(false)` when the frame was dropped: the connection is not
    /// open, or the writer is still behind on earlier frames. Frames are never
    /// held back for a later connection.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if the frame cannot be encoded
    pub fn send_frame(&mut self, frame: &Frame) -> Result<bool> {
        if self.state != ConnectionState::Open {
            self.frames_dropped += 1;
            tracing::trace!(
                sequence = frame.sequence(),
                state = ?self.state,
                "dropping frame, connection not open"
            );
            return Ok(false);
        }

        let json = OutboundMessage::audio(frame.pcm()).to_json()?;
        match self.queue(Message::Text(json)) {
            Ok(()) => {
                self.frames_sent += 1;
                Ok(true)
            }
            Err(TrySendError::Full(_)) => {
                self.frames_dropped += 1;
                tracing::debug!(sequence = frame.sequence(), "dropping frame, socket backed up");
                Ok(false)
            }
            Err(TrySendError::Closed(_)) => {
                // The writer reports its own failure through the event channel
                self.frames_dropped += 1;
                tracing::trace!(sequence = frame.sequence(), "dropping frame, writer gone");
                Ok(false)
            }
        }
    }

    fn queue(&self, message: Message) -> std::result::Result<(), TrySendError<Message>> {
        match &self.writer {
            Some(writer) => writer.outbound.try_send(message),
            None => Err(TrySendError::Closed(message)),
        }
    }

    /// Close the connection with a normal close code
    ///
    /// Safe to call in any state; never waits on the socket.
    pub fn close(&mut self) {
        let was_open = self.state == ConnectionState::Open;
        if matches!(self.state, ConnectionState::Idle | ConnectionState::Closed) {
            return;
        }

        self.state = ConnectionState::Closing;
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        if self.queue(Message::Close(Some(frame))).is_err() {
            tracing::debug!("close frame not queued, writer busy or gone");
        }

        self.release();
        if was_open {
            self.last_close_code = Some(u16::from(CloseCode::Normal));
        }
        self.state = ConnectionState::Closed;
        tracing::info!("voice connection closed locally");
    }

    fn fail(&mut self, reason: String) -> ConnectionEvent {
        tracing::warn!(error = %reason, state = ?self.state, "voice connection error");
        self.state = ConnectionState::Erroring;
        self.release();
        self.last_error = Some(reason.clone());
        self.state = ConnectionState::Closed;
        ConnectionEvent::Error(reason)
    }

    /// Stop the socket tasks; anything they report afterwards is stale
    fn release(&mut self) {
        if let Some(connector) = self.connector.take() {
            connector.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(Writer { outbound, mut task }) = self.writer.take() {
            // Dropping the sender lets the writer flush what is queued, then exit
            drop(outbound);
            tokio::spawn(async move {
                if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut task)
                    .await
                    .is_err()
                {
                    tracing::debug!("writer did not drain in time, aborting");
                    task.abort();
                }
            });
        }
        self.generation += 1;
    }

    /// Current lifecycle state
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether frames are currently being sent
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Code of the most recent close
    #[must_use]
    pub const fn last_close_code(&self) -> Option<u16> {
        self.last_close_code
    }

    /// Reason of the most recent transport error
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Frames handed to the writer since creation
    #[must_use]
    pub const fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Frames dropped because the connection was not open or backed up
    #[must_use]
    pub const fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(connector) = self.connector.take() {
            connector.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(writer) = self.writer.take() {
            writer.task.abort();
        }
    }
}

/// Write queued messages to the socket until the queue closes
async fn write_loop(
    mut sink: WsSink,
    mut outbound: mpsc::Receiver<Message>,
    generation: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            if !closing {
                let _ = events.send(TransportEvent {
                    generation,
                    transport: Transport::Failed(e.to_string()),
                });
            }
            return;
        }
        if closing {
            break;
        }
    }

    let _ = sink.close().await;
}

/// Forward inbound frames until the socket ends
async fn read_loop(
    mut stream: SplitStream<WsStream>,
    generation: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let report = |transport| {
        let _ = events.send(TransportEvent {
            generation,
            transport,
        });
    };

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => report(Transport::Message(text)),
            Ok(Message::Close(frame)) => {
                let code = frame.map_or(CLOSE_NO_STATUS, |f| u16::from(f.code));
                report(Transport::Closed(code));
                return;
            }
            Ok(Message::Binary(data)) => {
                tracing::trace!(bytes = data.len(), "ignoring binary frame");
            }
            Ok(_) => {}
            Err(
                tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake)
                | tungstenite::Error::ConnectionClosed,
            ) => {
                report(Transport::Closed(CLOSE_ABNORMAL));
                return;
            }
            Err(e) => {
                report(Transport::Failed(e.to_string()));
                return;
            }
        }
    }

    report(Transport::Closed(CLOSE_ABNORMAL));
}
