//! Voice processing module
//!
//! Handles microphone capture, the real-time processing stages and ordered
//! playback of reply audio.

mod capture;
mod cpal_host;
mod host;
mod playback;
mod processor;
mod resample;

pub use capture::CaptureEngine;
pub use cpal_host::CpalHost;
pub use host::{ActiveGraph, AudioHost, Microphone, ProcessorRegistry, RegisterError};
pub use playback::{DEFAULT_MAX_QUEUED_SEGMENTS, PlaybackQueue, PlaybackSegment, SegmentSink};
pub use processor::{
    AudioMessage, CaptureStage, Frame, GraphStages, LevelAnalyser, LevelMeter, PROCESSOR_NAME,
    ProcessorPort, RenderStage, calculate_rms, stream_processor,
};
pub use resample::StreamResampler;
