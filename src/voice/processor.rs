//! Real-time processing stages
//!
//! These halves of the audio graph run on the audio callback threads. They
//! never share mutable state with the control task: captured frames and drain
//! signals flow out over an unbounded tokio channel, segments to play flow in
//! over a std channel polled with `try_recv`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc as std_mpsc;

use tokio::sync::mpsc;

use super::playback::{PlaybackSegment, SegmentSink};
use crate::{Error, Result, codec};

/// Name under which the processing module registers with the audio host
pub const PROCESSOR_NAME: &str = "stream_processor";

/// One captured block of PCM16 little-endian audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    sequence: u64,
    pcm: Vec<u8>,
}

impl Frame {
    /// Create a frame from raw PCM bytes
    #[must_use]
    pub const fn new(sequence: u64, pcm: Vec<u8>) -> Self {
        Self { sequence, pcm }
    }

    /// Position of this frame in capture order
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Raw PCM bytes
    #[must_use]
    pub fn pcm(&self) -> &[u8] {
        &self.pcm
    }
}

/// Messages posted from the audio context to the control task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioMessage {
    /// A completed input block
    Input(Frame),
    /// The render stage finished playing a segment
    Done {
        /// Id of the drained segment
        segment: u64,
    },
}

/// Latest input level, readable from any thread
#[derive(Debug, Clone, Default)]
pub struct LevelMeter(Arc<AtomicU32>);

impl LevelMeter {
    /// Create a meter reading zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent RMS level in [0.0, 1.0]
    #[must_use]
    pub fn level(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn set(&self, level: f32) {
        self.0.store(level.to_bits(), Ordering::Relaxed);
    }

    /// Reset to silence
    pub fn reset(&self) {
        self.set(0.0);
    }
}

/// Analysis stage: measures the level of every input block
#[derive(Debug, Clone)]
pub struct LevelAnalyser {
    meter: LevelMeter,
}

impl LevelAnalyser {
    /// Create an analyser publishing to `meter`
    #[must_use]
    pub const fn new(meter: LevelMeter) -> Self {
        Self { meter }
    }

    /// Measure a block and publish its RMS level
    pub fn analyse(&self, block: &[f32]) -> f32 {
        let level = calculate_rms(block);
        self.meter.set(level);
        level
    }
}

/// Calculate RMS energy
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Input half of the processing stage
///
/// Every block is forwarded; silence detection is not performed here.
#[derive(Debug)]
pub struct CaptureStage {
    tx: mpsc::UnboundedSender<AudioMessage>,
    next_sequence: u64,
}

impl CaptureStage {
    /// Convert a block to a frame and post it to the control task
    ///
    /// Returns false once the control side has gone away.
    pub fn process(&mut self, block: &[f32]) -> bool {
        if block.is_empty() {
            return !self.tx.is_closed();
        }

        let frame = Frame::new(self.next_sequence, codec::f32_to_pcm16_bytes(block));
        self.next_sequence += 1;
        self.tx.send(AudioMessage::Input(frame)).is_ok()
    }

    /// Number of frames emitted so far
    #[must_use]
    pub const fn frames_emitted(&self) -> u64 {
        self.next_sequence
    }
}

struct Playing {
    id: u64,
    samples: Vec<f32>,
    position: usize,
}

/// Output half of the processing stage
///
/// Plays at most one segment at a time and posts `Done` when it runs out.
pub struct RenderStage {
    segments: std_mpsc::Receiver<PlaybackSegment>,
    current: Option<Playing>,
    tx: mpsc::UnboundedSender<AudioMessage>,
}

impl RenderStage {
    /// Fill an interleaved output buffer, duplicating mono samples across channels
    pub fn render(&mut self, out: &mut [f32], channels: usize) {
        for frame in out.chunks_mut(channels.max(1)) {
            let sample = self.next_sample();
            for slot in frame.iter_mut() {
                *slot = sample;
            }
        }
    }

    /// Whether a segment is currently being played
    #[must_use]
    pub const fn is_playing(&self) -> bool {
        self.current.is_some()
    }

    fn next_sample(&mut self) -> f32 {
        loop {
            if self.current.is_none() {
                match self.segments.try_recv() {
                    Ok(segment) => {
                        let (id, samples) = segment.into_parts();
                        self.current = Some(Playing {
                            id,
                            samples,
                            position: 0,
                        });
                    }
                    Err(_) => return 0.0,
                }
            }

            if let Some(playing) = self.current.as_mut() {
                if let Some(&sample) = playing.samples.get(playing.position) {
                    playing.position += 1;
                    return sample;
                }

                let segment = playing.id;
                self.current = None;
                let _ = self.tx.send(AudioMessage::Done { segment });
            }
        }
    }
}

/// Control-side handle for feeding segments to the render stage
#[derive(Debug, Clone)]
pub struct ProcessorPort {
    segments: std_mpsc::Sender<PlaybackSegment>,
}

impl ProcessorPort {
    /// Hand a segment to the render stage
    ///
    /// # Errors
    ///
    /// Returns `Error::Playback` if the render stage has been disconnected
    pub fn post(&self, segment: PlaybackSegment) -> Result<()> {
        let id = segment.id();
        self.segments
            .send(segment)
            .map_err(|_| Error::Playback(format!("render stage disconnected (segment {id})")))
    }
}

impl SegmentSink for ProcessorPort {
    fn play(&mut self, segment: PlaybackSegment) -> Result<()> {
        self.post(segment)
    }
}

/// Stages handed to the audio host when building a graph
pub struct GraphStages {
    /// Analysis stage, wired directly after the source
    pub analyser: LevelAnalyser,
    /// Input half of the processor
    pub capture: CaptureStage,
    /// Output half of the processor, wired to the destination
    pub render: RenderStage,
}

/// Create a connected set of processing stages
///
/// Returns the stages for the audio host, the port for posting segments and
/// the receiver the control task reads frames and drain signals from.
#[must_use]
pub fn stream_processor(
    meter: LevelMeter,
) -> (GraphStages, ProcessorPort, mpsc::UnboundedReceiver<AudioMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (segment_tx, segment_rx) = std_mpsc::channel();

    let stages = GraphStages {
        analyser: LevelAnalyser::new(meter),
        capture: CaptureStage {
            tx: tx.clone(),
            next_sequence: 0,
        },
        render: RenderStage {
            segments: segment_rx,
            current: None,
            tx,
        },
    };

    (
        stages,
        ProcessorPort {
            segments: segment_tx,
        },
        rx,
    )
}
