//! cpal-backed audio host
//!
//! Streams are created and owned by a dedicated audio thread because cpal
//! streams cannot move between threads. The control side only holds a stop
//! channel and the thread handle, and never blocks on either: readiness
//! arrives over a oneshot and the thread is joined off the runtime.
//!
//! Devices run at whatever rate they support; frames are resampled to and
//! from the configured wire rates.

use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, Stream, StreamConfig, SupportedStreamConfigRange};
use tokio::sync::oneshot;

use super::host::{ActiveGraph, AudioHost, Microphone, ProcessorRegistry, RegisterError};
use super::processor::{CaptureStage, GraphStages, LevelAnalyser, RenderStage};
use super::resample::StreamResampler;
use crate::config::VoiceConfig;
use crate::{Error, Result};

/// Pace of the silent destination used when no output device exists
const NULL_SINK_TICK: Duration = Duration::from_millis(10);

/// How long the audio thread may take to open its streams
const GRAPH_SETUP_TIMEOUT: Duration = Duration::from_secs(5);

type Ready = oneshot::Sender<std::result::Result<(), String>>;

/// Audio host using the default cpal input and output devices
#[derive(Debug)]
pub struct CpalHost {
    registry: ProcessorRegistry,
    capture_rate: u32,
    playback_rate: u32,
}

impl CpalHost {
    /// Create a host exchanging audio at the given wire sample rates
    #[must_use]
    pub fn new(capture_rate: u32, playback_rate: u32) -> Self {
        Self {
            registry: ProcessorRegistry::new(),
            capture_rate,
            playback_rate,
        }
    }

    /// Create a host from voice configuration
    #[must_use]
    pub fn from_config(voice: &VoiceConfig) -> Self {
        Self::new(voice.capture_sample_rate, voice.playback_sample_rate)
    }

    /// Start an output-only graph around a render stage
    ///
    /// The microphone is never opened, so this works on machines without one.
    ///
    /// # Errors
    ///
    /// Returns `Error::AudioInit` if no output stream can be started
    pub async fn build_playback_graph(&self, render: RenderStage) -> Result<Box<dyn ActiveGraph>> {
        self.spawn_graph(None, render, None).await
    }

    async fn spawn_graph(
        &self,
        input: Option<InputStages>,
        render: RenderStage,
        mut microphone: Option<Box<dyn Microphone>>,
    ) -> Result<Box<dyn ActiveGraph>> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel();
        let rates = WireRates {
            capture: self.capture_rate,
            playback: self.playback_rate,
        };

        let spawned = std::thread::Builder::new()
            .name("voice-link-audio".to_string())
            .spawn(move || run_audio_thread(input, render, rates, ready_tx, &stop_rx));

        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                release(&mut microphone);
                return Err(Error::AudioInit(format!("failed to spawn audio thread: {e}")));
            }
        };

        let failure = match tokio::time::timeout(GRAPH_SETUP_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                tracing::debug!(
                    capture_rate = rates.capture,
                    playback_rate = rates.playback,
                    input = microphone.is_some(),
                    "audio graph started"
                );
                return Ok(Box::new(CpalGraph {
                    stop_tx: Some(stop_tx),
                    thread: Some(thread),
                    microphone,
                }));
            }
            Ok(Ok(Err(message))) => message,
            Ok(Err(_)) => "audio thread exited during setup".to_string(),
            Err(_) => "audio graph setup timed out".to_string(),
        };

        let _ = stop_tx.send(());
        reap(thread);
        release(&mut microphone);
        Err(Error::AudioInit(failure))
    }
}

#[derive(Debug, Clone, Copy)]
struct WireRates {
    capture: u32,
    playback: u32,
}

struct InputStages {
    analyser: LevelAnalyser,
    capture: CaptureStage,
}

fn release(microphone: &mut Option<Box<dyn Microphone>>) {
    if let Some(mut microphone) = microphone.take() {
        microphone.stop();
    }
}

/// Join the audio thread off the async runtime
fn reap(thread: JoinHandle<()>) {
    // Without a runtime the thread is detached and exits on its own
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn_blocking(move || {
            if thread.join().is_err() {
                tracing::warn!("audio thread panicked");
            }
        });
    }
}

struct CpalMicrophone {
    device_name: String,
    released: bool,
}

impl Microphone for CpalMicrophone {
    fn label(&self) -> String {
        self.device_name.clone()
    }

    fn stop(&mut self) {
        if !self.released {
            self.released = true;
            tracing::debug!(device = %self.device_name, "microphone released");
        }
    }
}

struct CpalGraph {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    microphone: Option<Box<dyn Microphone>>,
}

impl ActiveGraph for CpalGraph {
    fn disconnect(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            reap(thread);
        }
        release(&mut self.microphone);
    }
}

impl Drop for CpalGraph {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[async_trait]
impl AudioHost for CpalHost {
    fn name(&self) -> &str {
        "cpal"
    }

    async fn request_microphone(&self) -> Result<Box<dyn Microphone>> {
        let device_name = tokio::task::spawn_blocking(|| {
            cpal::default_host()
                .default_input_device()
                .map(|d| d.name().unwrap_or_default())
        })
        .await
        .map_err(|e| Error::Permission(format!("microphone request failed: {e}")))?
        .ok_or_else(|| Error::Permission("no input device available".to_string()))?;

        tracing::debug!(device = %device_name, "microphone acquired");

        Ok(Box::new(CpalMicrophone {
            device_name,
            released: false,
        }))
    }

    fn register_processor(&self, name: &str) -> std::result::Result<(), RegisterError> {
        self.registry.register(name)
    }

    async fn build_graph(
        &self,
        microphone: Box<dyn Microphone>,
        stages: GraphStages,
    ) -> Result<Box<dyn ActiveGraph>> {
        let GraphStages {
            analyser,
            capture,
            render,
        } = stages;
        tracing::debug!(device = %microphone.label(), "building audio graph");

        self.spawn_graph(
            Some(InputStages { analyser, capture }),
            render,
            Some(microphone),
        )
        .await
    }
}

/// Body of the audio thread: build streams, report readiness, wait for stop
fn run_audio_thread(
    input: Option<InputStages>,
    render: RenderStage,
    rates: WireRates,
    ready: Ready,
    stop: &std_mpsc::Receiver<()>,
) {
    let host = cpal::default_host();
    let capturing = input.is_some();

    let input = match input.map(|stages| build_input(&host, rates.capture, stages)) {
        Some(Ok(stream)) => Some(stream),
        Some(Err(e)) => {
            let _ = ready.send(Err(e));
            return;
        }
        None => None,
    };

    let render = Arc::new(Mutex::new(render));
    let output = match build_output(&host, rates.playback, Arc::clone(&render)) {
        Ok(stream) => Some(stream),
        Err(e) if capturing => {
            tracing::warn!(error = %e, "no audio output, replies will be rendered silently");
            None
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    if let Some(input) = &input
        && let Err(e) = input.play()
    {
        let _ = ready.send(Err(format!("failed to start input stream: {e}")));
        return;
    }
    if let Some(output) = &output
        && let Err(e) = output.play()
    {
        let _ = ready.send(Err(format!("failed to start output stream: {e}")));
        return;
    }

    if ready.send(Ok(())).is_err() {
        tracing::debug!("graph setup abandoned, releasing streams");
        return;
    }

    if output.is_some() {
        let _ = stop.recv();
    } else {
        run_null_sink(&render, rates.playback, stop);
    }

    drop(input);
    drop(output);
    tracing::debug!("audio graph released");
}

/// Drain the render stage in real time without an output device
fn run_null_sink(render: &Mutex<RenderStage>, playback_rate: u32, stop: &std_mpsc::Receiver<()>) {
    let tick_samples = (playback_rate / 100).max(1) as usize;
    let mut scratch = vec![0.0f32; tick_samples];

    while let Err(std_mpsc::RecvTimeoutError::Timeout) = stop.recv_timeout(NULL_SINK_TICK) {
        if let Ok(mut render) = render.lock() {
            render.render(&mut scratch, 1);
        }
    }
}

fn build_input(
    host: &cpal::Host,
    wire_rate: u32,
    stages: InputStages,
) -> std::result::Result<Stream, String> {
    let InputStages {
        analyser,
        mut capture,
    } = stages;
    let device = host
        .default_input_device()
        .ok_or_else(|| "no input device".to_string())?;

    let default_rate = device.default_input_config().ok().map(|c| c.sample_rate().0);
    let configs: Vec<SupportedStreamConfigRange> = device
        .supported_input_configs()
        .map_err(|e| e.to_string())?
        .collect();
    let config = select_config(&configs, wire_rate, default_rate)
        .ok_or_else(|| "no f32 input config available".to_string())?;
    let channels = usize::from(config.channels.max(1));
    let device_rate = config.sample_rate.0;
    let mut resampler = StreamResampler::new(device_rate, wire_rate).map_err(|e| e.to_string())?;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        device_rate,
        wire_rate,
        channels,
        resampling = !resampler.is_passthrough(),
        "audio capture initialized"
    );

    device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let block = resampler.process(&downmix(data, channels));
                if block.is_empty() {
                    return;
                }
                analyser.analyse(&block);
                capture.process(&block);
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| e.to_string())
}

fn build_output(
    host: &cpal::Host,
    wire_rate: u32,
    render: Arc<Mutex<RenderStage>>,
) -> std::result::Result<Stream, String> {
    let device = host
        .default_output_device()
        .ok_or_else(|| "no output device".to_string())?;

    let default_rate = device.default_output_config().ok().map(|c| c.sample_rate().0);
    let configs: Vec<SupportedStreamConfigRange> = device
        .supported_output_configs()
        .map_err(|e| e.to_string())?
        .collect();
    let config = select_config(&configs, wire_rate, default_rate)
        .ok_or_else(|| "no f32 output config available".to_string())?;
    let channels = usize::from(config.channels.max(1));
    let device_rate = config.sample_rate.0;
    let mut feed = OutputFeed::new(render, wire_rate, device_rate).map_err(|e| e.to_string())?;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        device_rate,
        wire_rate,
        channels,
        "audio playback initialized"
    );

    device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| feed.fill(data, channels),
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| e.to_string())
}

/// Pulls wire-rate samples from the render stage at the device rate
struct OutputFeed {
    render: Arc<Mutex<RenderStage>>,
    resampler: StreamResampler,
    pending: VecDeque<f32>,
    scratch: Vec<f32>,
}

impl OutputFeed {
    fn new(render: Arc<Mutex<RenderStage>>, wire_rate: u32, device_rate: u32) -> Result<Self> {
        Ok(Self {
            render,
            resampler: StreamResampler::new(wire_rate, device_rate)?,
            pending: VecDeque::new(),
            scratch: Vec::new(),
        })
    }

    /// Fill an interleaved device buffer
    fn fill(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = out.len() / channels;

        while self.pending.len() < frames {
            let pull = self
                .resampler
                .input_frames_next()
                .unwrap_or(frames - self.pending.len());
            self.scratch.resize(pull, 0.0);
            match self.render.lock() {
                Ok(mut render) => render.render(&mut self.scratch, 1),
                Err(_) => self.scratch.fill(0.0),
            }

            let converted = self.resampler.process(&self.scratch);
            if converted.is_empty() {
                break;
            }
            self.pending.extend(converted);
        }

        for frame in out.chunks_mut(channels) {
            frame.fill(self.pending.pop_front().unwrap_or(0.0));
        }
    }
}

/// Pick an f32 config, preferring the wire rate, then the device default
fn select_config(
    configs: &[SupportedStreamConfigRange],
    wire_rate: u32,
    default_rate: Option<u32>,
) -> Option<StreamConfig> {
    let candidates: Vec<&SupportedStreamConfigRange> = configs
        .iter()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .collect();

    config_at(&candidates, wire_rate)
        .or_else(|| default_rate.and_then(|rate| config_at(&candidates, rate)))
        .or_else(|| {
            candidates
                .first()
                .map(|c| (*c).clone().with_max_sample_rate().config())
        })
}

/// A config running at exactly `rate`, preferring mono
fn config_at(candidates: &[&SupportedStreamConfigRange], rate: u32) -> Option<StreamConfig> {
    let rate = SampleRate(rate);
    let fits: Vec<&SupportedStreamConfigRange> = candidates
        .iter()
        .copied()
        .filter(|c| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
        .collect();

    fits.iter()
        .find(|c| c.channels() == 1)
        .or_else(|| fits.first())
        .map(|c| (*c).clone().with_sample_rate(rate).config())
}

/// Average interleaved channels into a mono block
#[allow(clippy::cast_precision_loss)]
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}
