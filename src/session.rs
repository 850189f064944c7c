//! Session controller
//!
//! A single tokio task owns the capture engine, the connection and the
//! playback queue. Commands from [`SessionHandle`], microphone grants, socket
//! events and audio-context messages are all serialized through one
//! `select!` loop, so none of that state is ever shared.
//!
//! ```text
//! start ─▶ request microphone ─▶ open connection ─▶ Opened ─▶ capture start
//!                                                            │
//!   frames ◀── capture stage ◀── microphone                  ▼
//!     │                                                  "Connected"
//!     └─▶ input_audio_buffer.append ─▶ service
//!   service ─▶ response.audio.delta ─▶ playback queue ─▶ render stage
//!   render Done + response.done ─▶ TurnListener
//! ```

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use crate::codec;
use crate::config::Config;
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::protocol::{InboundEvent, OutboundMessage};
use crate::turns::TurnListener;
use crate::voice::{AudioHost, AudioMessage, CaptureEngine, LevelMeter, Microphone, PlaybackQueue};
use crate::{Error, Result};

/// User-visible session status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// No session has run yet
    Idle,
    /// Waiting for the microphone or the connection
    Connecting,
    /// Connection open and handshake sent
    Connected,
    /// Connection closed with a code
    Disconnected(u16),
    /// Transport failure without a close code
    ConnectionError,
    /// The connection could not be attempted at all
    ConnectionFailed,
    /// Start aborted, e.g. microphone denied
    Error(String),
    /// Processing module or audio graph failed
    AudioInit(String),
    /// Error event reported by the service
    ServiceError(String),
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnected(code) => write!(f, "Disconnected ({code})"),
            Self::ConnectionError => write!(f, "Connection error"),
            Self::ConnectionFailed => write!(f, "Connection failed"),
            Self::Error(message) | Self::ServiceError(message) => write!(f, "Error: {message}"),
            Self::AudioInit(message) => write!(f, "Error initializing audio: {message}"),
        }
    }
}

/// Observable session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Capture is running and frames flow to the service
    pub is_recording: bool,
    /// A start attempt is in flight
    pub busy: bool,
    /// Most recent condition
    pub status: Status,
    /// Flow the session talks to
    pub target: Option<String>,
    /// Identifier of the most recent start attempt
    pub session_id: Option<uuid::Uuid>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            is_recording: false,
            busy: false,
            status: Status::Idle,
            target: None,
            session_id: None,
        }
    }
}

enum Command {
    Start {
        target: String,
        done: oneshot::Sender<SessionSnapshot>,
    },
    Stop {
        done: oneshot::Sender<SessionSnapshot>,
    },
    Shutdown,
}

type Grant = (u64, Result<Box<dyn Microphone>>);

/// Cloneable handle to a running session controller
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionSnapshot>,
    meter: LevelMeter,
}

impl SessionHandle {
    /// Start recording for `target`
    ///
    /// Resolves once the attempt has either started capture or failed; the
    /// returned snapshot carries the outcome. A no-op while already recording
    /// or starting.
    ///
    /// # Errors
    ///
    /// Returns `Error::Session` if the controller task is gone
    pub async fn start(&self, target: impl Into<String>) -> Result<SessionSnapshot> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Start {
            target: target.into(),
            done,
        })?;
        rx.await
            .map_err(|_| Error::Session("controller dropped start request".to_string()))
    }

    /// Stop recording and close the connection; safe in any state
    ///
    /// # Errors
    ///
    /// Returns `Error::Session` if the controller task is gone
    pub async fn stop(&self) -> Result<SessionSnapshot> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Stop { done })?;
        rx.await
            .map_err(|_| Error::Session("controller dropped stop request".to_string()))
    }

    /// Stop the controller task
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::Session("controller is not running".to_string()))
    }

    /// Current state
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Whether capture is running
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.state.borrow().is_recording
    }

    /// Whether a start attempt is in flight
    #[must_use]
    pub fn busy(&self) -> bool {
        self.state.borrow().busy
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> Status {
        self.state.borrow().status.clone()
    }

    /// Receiver notified on every state change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    /// Wait until the state satisfies `predicate`
    ///
    /// # Errors
    ///
    /// Returns `Error::Session` if the controller exits first
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot> {
        let mut state = self.state.clone();
        let snapshot = state
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| Error::Session("controller exited".to_string()))?;
        Ok(snapshot.clone())
    }

    /// Current microphone level in [0.0, 1.0]
    #[must_use]
    pub fn input_level(&self) -> f32 {
        self.meter.level()
    }
}

/// Owns every piece of a voice session
pub struct SessionController {
    config: Config,
    capture: CaptureEngine,
    connection: ConnectionManager,
    playback: PlaybackQueue,
    listener: Arc<dyn TurnListener>,
    state: watch::Sender<SessionSnapshot>,
    commands: mpsc::UnboundedReceiver<Command>,
    grants_tx: mpsc::UnboundedSender<Grant>,
    grants_rx: mpsc::UnboundedReceiver<Grant>,
    epoch: u64,
    pending: Option<oneshot::Sender<SessionSnapshot>>,
    microphone: Option<Box<dyn Microphone>>,
}

impl SessionController {
    /// Spawn the controller on the current runtime
    #[must_use]
    pub fn spawn(
        config: &Config,
        host: Arc<dyn AudioHost>,
        listener: Arc<dyn TurnListener>,
    ) -> SessionHandle {
        let handshake = OutboundMessage::VoiceConfig {
            enabled: config.voice.elevenlabs,
            voice_id: config.voice.voice_id.clone(),
        };
        let connection =
            ConnectionManager::new(handshake).with_api_key(config.server.api_key.clone());
        let capture = CaptureEngine::new(host);
        let meter = capture.meter();

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (grants_tx, grants_rx) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(SessionSnapshot::default());

        let controller = Self {
            config: config.clone(),
            capture,
            connection,
            playback: PlaybackQueue::new(config.voice.max_queued_segments),
            listener,
            state,
            commands,
            grants_tx,
            grants_rx,
            epoch: 0,
            pending: None,
            microphone: None,
        };
        tokio::spawn(controller.run());

        SessionHandle {
            commands: commands_tx,
            state: state_rx,
            meter,
        }
    }

    async fn run(mut self) {
        tracing::debug!("session controller started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Start { target, done }) => self.start(target, done),
                    Some(Command::Stop { done }) => {
                        self.stop();
                        let _ = done.send(self.snapshot());
                    }
                    Some(Command::Shutdown) | None => break,
                },
                Some((epoch, grant)) = self.grants_rx.recv() => {
                    self.on_microphone(epoch, grant);
                }
                Some(event) = self.connection.recv() => {
                    if let Some(event) = self.connection.apply(event) {
                        self.on_connection_event(event).await;
                    }
                }
                message = self.capture.next_message() => self.on_audio_message(message),
            }
        }

        self.stop();
        tracing::debug!("session controller stopped");
    }

    fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    fn update(&self, apply: impl FnOnce(&mut SessionSnapshot)) {
        self.state.send_modify(apply);
    }

    fn set_status(&self, status: Status) {
        tracing::info!(status = %status, "session status");
        self.update(|s| s.status = status);
    }

    fn resolve_pending(&mut self) {
        if let Some(done) = self.pending.take() {
            let _ = done.send(self.snapshot());
        }
    }

    fn start(&mut self, target: String, done: oneshot::Sender<SessionSnapshot>) {
        let current = self.snapshot();
        if current.is_recording || current.busy {
            tracing::debug!(flow = %target, "start ignored, session already active");
            let _ = done.send(current);
            return;
        }

        self.epoch += 1;
        self.pending = Some(done);
        self.playback.clear();
        let session_id = uuid::Uuid::new_v4();
        self.update(|s| {
            s.busy = true;
            s.target = Some(target.clone());
            s.session_id = Some(session_id);
        });
        self.set_status(Status::Connecting);
        tracing::info!(%session_id, flow = %target, epoch = self.epoch, "starting voice session");

        let host = self.capture.host();
        let grants = self.grants_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let grant = CaptureEngine::request_access(host.as_ref()).await;
            let _ = grants.send((epoch, grant));
        });
    }

    fn on_microphone(&mut self, epoch: u64, grant: Result<Box<dyn Microphone>>) {
        if epoch != self.epoch || self.pending.is_none() {
            tracing::debug!(epoch, current = self.epoch, "discarding stale microphone result");
            if let Ok(mut microphone) = grant {
                microphone.stop();
            }
            return;
        }

        let microphone = match grant {
            Ok(microphone) => microphone,
            Err(e) => {
                tracing::warn!(error = %e, "microphone access failed");
                self.end_session(Status::Error(describe(&e)));
                return;
            }
        };

        let target = self.snapshot().target.unwrap_or_default();
        let opened = self
            .config
            .voice_url(&target)
            .and_then(|url| self.connection.open(url.as_str()));

        match opened {
            Ok(()) => self.microphone = Some(microphone),
            Err(e) => {
                let mut microphone = microphone;
                microphone.stop();
                tracing::warn!(error = %e, "failed to open voice connection");
                self.end_session(Status::ConnectionFailed);
            }
        }
    }

    async fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened => self.on_open().await,
            ConnectionEvent::Message(text) => self.handle_inbound(&text),
            ConnectionEvent::Closed { code } => {
                self.end_session(Status::Disconnected(code));
            }
            ConnectionEvent::Error(reason) => {
                tracing::debug!(error = %reason, "ending session after connection error");
                self.end_session(Status::ConnectionError);
            }
        }
    }

    async fn on_open(&mut self) {
        self.set_status(Status::Connected);

        let Some(microphone) = self.microphone.take() else {
            tracing::warn!("connection opened without a microphone, closing");
            self.connection.close();
            self.end_session(Status::Error("microphone was released".to_string()));
            return;
        };

        match self.capture.start(microphone).await {
            Ok(()) => {
                self.update(|s| {
                    s.is_recording = true;
                    s.busy = false;
                });
                self.resolve_pending();
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to start capture");
                self.connection.close();
                self.end_session(Status::AudioInit(describe(&e)));
            }
        }
    }

    fn handle_inbound(&mut self, text: &str) {
        let event = match InboundEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed message");
                return;
            }
        };

        match &event {
            InboundEvent::AudioDelta { delta } => match codec::decode(delta) {
                Ok(bytes) => {
                    let samples = codec::pcm16_bytes_to_f32(&bytes);
                    match self.playback.enqueue(samples, &mut self.capture) {
                        Ok(true) => self.turn_drained(),
                        Ok(false) => {}
                        Err(e) => tracing::warn!(error = %e, "reply segment rejected"),
                    }
                }
                Err(e) => tracing::warn!(error = %e, "dropping audio delta"),
            },
            InboundEvent::ResponseDone => {
                tracing::debug!("reply complete");
                if self.playback.mark_turn_done() {
                    self.turn_drained();
                }
            }
            InboundEvent::Error { .. } => {
                let message = event.error_message().unwrap_or_default();
                tracing::warn!(error = %message, "service reported an error");
                self.set_status(Status::ServiceError(message));
            }
            InboundEvent::BuildProgress { data } => {
                tracing::debug!(progress = %data, "flow build progress");
            }
            InboundEvent::Other => tracing::trace!("ignoring unhandled event"),
        }
    }

    fn turn_drained(&self) {
        if let Some(target) = self.snapshot().target {
            tracing::debug!(flow = %target, "reply drained, fetching next turn");
            self.listener.on_turn_drained(&target);
        }
    }

    fn on_audio_message(&mut self, message: Option<AudioMessage>) {
        match message {
            Some(AudioMessage::Input(frame)) => {
                if let Err(e) = self.connection.send_frame(&frame) {
                    tracing::warn!(error = %e, sequence = frame.sequence(), "frame not sent");
                }
            }
            Some(AudioMessage::Done { segment }) => {
                if self.playback.finish_current(segment, &mut self.capture) {
                    self.turn_drained();
                }
            }
            None => {
                tracing::error!("audio context stopped unexpectedly");
                self.connection.close();
                self.end_session(Status::AudioInit("audio stream ended".to_string()));
            }
        }
    }

    /// Release everything and publish a final status
    fn end_session(&mut self, status: Status) {
        self.epoch += 1;
        if let Some(mut microphone) = self.microphone.take() {
            microphone.stop();
        }
        self.connection.close();
        self.capture.teardown();
        self.playback.clear();
        self.update(|s| {
            s.is_recording = false;
            s.busy = false;
        });
        self.set_status(status);
        self.resolve_pending();
    }

    fn stop(&mut self) {
        let was_open = self.connection.is_open();
        let was_starting = self.pending.is_some();
        let was_recording = self.snapshot().is_recording;

        if !was_open && !was_starting && !was_recording && !self.capture.is_active() {
            tracing::debug!("stop ignored, no active session");
            return;
        }

        tracing::info!("stopping voice session");
        let status = if was_open {
            self.connection.close();
            self.connection
                .last_close_code()
                .map_or(Status::Idle, Status::Disconnected)
        } else {
            Status::Idle
        };
        self.end_session(status);
    }
}

/// Human-readable message of an error, without the category prefix
fn describe(error: &Error) -> String {
    match error {
        Error::Permission(message)
        | Error::AudioInit(message)
        | Error::Connection(message)
        | Error::Config(message)
        | Error::Playback(message)
        | Error::Codec(message)
        | Error::Session(message) => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(Status::Connected.to_string(), "Connected");
        assert_eq!(Status::Disconnected(1006).to_string(), "Disconnected (1006)");
        assert_eq!(Status::ConnectionError.to_string(), "Connection error");
        assert_eq!(Status::ConnectionFailed.to_string(), "Connection failed");
        assert_eq!(
            Status::Error("Permission denied".to_string()).to_string(),
            "Error: Permission denied"
        );
        assert_eq!(
            Status::AudioInit("no stream".to_string()).to_string(),
            "Error initializing audio: no stream"
        );
    }

    #[test]
    fn test_describe_strips_category() {
        let e = Error::Permission("Permission denied".to_string());
        assert_eq!(describe(&e), "Permission denied");
        let e = Error::AudioInit("bad module".to_string());
        assert_eq!(describe(&e), "bad module");
    }

    #[test]
    fn test_default_snapshot() {
        let snapshot = SessionSnapshot::default();
        assert!(!snapshot.is_recording);
        assert!(!snapshot.busy);
        assert_eq!(snapshot.status, Status::Idle);
    }
}
