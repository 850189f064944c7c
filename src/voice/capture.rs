//! Capture engine
//!
//! Owns the microphone and the audio graph for one recording. The graph only
//! exists between `start` and `teardown`; it is rebuilt on every start.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::host::{ActiveGraph, AudioHost, Microphone, RegisterError};
use super::playback::{PlaybackSegment, SegmentSink};
use super::processor::{AudioMessage, LevelMeter, PROCESSOR_NAME, ProcessorPort, stream_processor};
use crate::{Error, Result};

/// Drives microphone capture and the processing graph
pub struct CaptureEngine {
    host: Arc<dyn AudioHost>,
    meter: LevelMeter,
    graph: Option<Box<dyn ActiveGraph>>,
    port: Option<ProcessorPort>,
    messages: Option<mpsc::UnboundedReceiver<AudioMessage>>,
}

impl CaptureEngine {
    /// Create an idle engine on top of `host`
    #[must_use]
    pub fn new(host: Arc<dyn AudioHost>) -> Self {
        Self {
            host,
            meter: LevelMeter::new(),
            graph: None,
            port: None,
            messages: None,
        }
    }

    /// The audio host, for spawning access requests off the control task
    #[must_use]
    pub fn host(&self) -> Arc<dyn AudioHost> {
        Arc::clone(&self.host)
    }

    /// Shared input level meter
    #[must_use]
    pub fn meter(&self) -> LevelMeter {
        self.meter.clone()
    }

    /// Ask the host for microphone access
    ///
    /// # Errors
    ///
    /// Returns `Error::Permission` if access is denied or unavailable
    pub async fn request_access(host: &dyn AudioHost) -> Result<Box<dyn Microphone>> {
        let microphone = host.request_microphone().await?;
        tracing::debug!(host = host.name(), device = %microphone.label(), "microphone access granted");
        Ok(microphone)
    }

    /// Build the graph around an acquired microphone and start capturing
    ///
    /// Starting an already running engine releases `microphone` and succeeds.
    ///
    /// # Errors
    ///
    /// Returns `Error::AudioInit` if the processor or graph cannot be set up;
    /// the microphone is released in that case
    pub async fn start(&mut self, mut microphone: Box<dyn Microphone>) -> Result<()> {
        if self.graph.is_some() {
            tracing::debug!("capture already running");
            microphone.stop();
            return Ok(());
        }

        if let Err(e) = self.register_processor() {
            microphone.stop();
            return Err(e);
        }

        let (stages, port, messages) = stream_processor(self.meter.clone());
        let graph = self.host.build_graph(microphone, stages).await?;

        self.graph = Some(graph);
        self.port = Some(port);
        self.messages = Some(messages);

        tracing::info!(host = self.host.name(), "capture started");
        Ok(())
    }

    /// Register the processing module, treating a repeat registration as success
    fn register_processor(&self) -> Result<()> {
        match self.host.register_processor(PROCESSOR_NAME) {
            Ok(()) => {
                tracing::debug!(processor = PROCESSOR_NAME, "processor registered");
                Ok(())
            }
            Err(RegisterError::AlreadyRegistered(name)) => {
                tracing::debug!(processor = %name, "processor already loaded, continuing");
                Ok(())
            }
            Err(RegisterError::Failed(reason)) => Err(Error::AudioInit(reason)),
        }
    }

    /// Wait for the next message from the audio context
    ///
    /// Pending forever while no graph exists. Returns `None` once if the
    /// audio context went away on its own.
    pub async fn next_message(&mut self) -> Option<AudioMessage> {
        let Some(messages) = self.messages.as_mut() else {
            return std::future::pending().await;
        };

        let message = messages.recv().await;
        if message.is_none() {
            tracing::warn!("audio context closed its message channel");
            self.messages = None;
        }
        message
    }

    /// Stop the microphone, disconnect the graph and drop its channels
    ///
    /// Returns true if a running graph was torn down. Safe to call repeatedly.
    pub fn teardown(&mut self) -> bool {
        self.port = None;
        self.messages = None;
        self.meter.reset();

        let Some(mut graph) = self.graph.take() else {
            return false;
        };
        graph.disconnect();
        tracing::info!("capture stopped");
        true
    }

    /// Whether a graph is running
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.graph.is_some()
    }
}

impl SegmentSink for CaptureEngine {
    fn play(&mut self, segment: PlaybackSegment) -> Result<()> {
        let port = self
            .port
            .as_ref()
            .ok_or_else(|| Error::Playback("audio graph is not running".to_string()))?;
        port.post(segment)
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.teardown();
    }
}
