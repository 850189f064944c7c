use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use voice_link::voice::{
    AudioHost, AudioMessage, CaptureEngine, CpalHost, LevelMeter, Microphone, PlaybackQueue,
    stream_processor,
};
use voice_link::{Config, MessageFetcher, SessionController, codec};

/// Voice Link - talk to a flow over a streaming voice connection
#[derive(Parser)]
#[command(name = "voicelink", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a voice session until interrupted
    Talk {
        /// Flow to talk to
        #[arg(short, long, env = "VOICE_LINK_FLOW")]
        flow: String,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Write the captured audio to a WAV file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Test speaker output
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,voice_link=info",
        1 => "info,voice_link=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;
    tracing::debug!(?config, "loaded configuration");

    match cli.command {
        Command::Talk { flow } => talk(&config, &flow).await,
        Command::TestMic { duration, output } => test_mic(&config, duration, output.as_deref()).await,
        Command::TestSpeaker => test_speaker(&config).await,
    }
}

/// Run a session, printing status changes until Ctrl-C
async fn talk(config: &Config, flow: &str) -> anyhow::Result<()> {
    let host = Arc::new(CpalHost::from_config(&config.voice));
    let listener = Arc::new(MessageFetcher::new(&config.server));
    let session = SessionController::spawn(config, host, listener);

    let mut updates = session.subscribe();
    let snapshot = session.start(flow).await?;
    println!("{}", snapshot.status);
    if !snapshot.is_recording {
        anyhow::bail!("session did not start: {}", snapshot.status);
    }
    println!("Listening. Press Ctrl-C to stop.");

    let mut last_status = snapshot.status;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = updates.borrow_and_update().clone();
                if current.status != last_status {
                    println!("{}", current.status);
                    last_status = current.status;
                }
                if !current.is_recording && !current.busy {
                    break;
                }
            }
        }
    }

    let snapshot = session.stop().await?;
    println!("{}", snapshot.status);
    session.shutdown();
    Ok(())
}

/// Test microphone input
async fn test_mic(config: &Config, duration: u64, output: Option<&Path>) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let host: Arc<dyn AudioHost> = Arc::new(CpalHost::from_config(&config.voice));
    let microphone = CaptureEngine::request_access(host.as_ref()).await?;
    println!("Device: {}", microphone.label());

    let mut engine = CaptureEngine::new(host);
    engine.start(microphone).await?;
    let meter = engine.meter();

    println!("Sample rate: {} Hz", config.voice.capture_sample_rate);
    println!("---");

    let mut recorded = Vec::new();
    let mut frames = 0_u64;
    for i in 0..duration {
        let tick = tokio::time::sleep(Duration::from_secs(1));
        tokio::pin!(tick);

        loop {
            tokio::select! {
                () = &mut tick => break,
                message = engine.next_message() => match message {
                    Some(AudioMessage::Input(frame)) => {
                        frames += 1;
                        if output.is_some() {
                            recorded.extend(codec::pcm16_bytes_to_f32(frame.pcm()));
                        }
                    }
                    Some(AudioMessage::Done { .. }) => {}
                    None => anyhow::bail!("audio stream ended"),
                },
            }
        }

        let energy = meter.level();

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let bar: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!("[{:2}s] RMS: {:.4} | Frames: {} | [{}]", i + 1, energy, frames, bar);
    }

    engine.teardown();

    if let Some(path) = output {
        let wav = codec::samples_to_wav(&recorded, config.voice.capture_sample_rate)?;
        std::fs::write(path, wav)?;
        println!("Wrote {} samples to {}", recorded.len(), path.display());
    }

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with a sine wave through the render stage
///
/// Opens the output device only; no microphone is needed.
async fn test_speaker(config: &Config) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let host = CpalHost::from_config(&config.voice);
    let (stages, mut port, mut messages) = stream_processor(LevelMeter::new());
    let mut graph = host.build_playback_graph(stages.render).await?;

    let sample_rate = config.voice.playback_sample_rate;
    let frequency = 440.0_f32;
    let num_samples = sample_rate as usize * 2;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    println!("Playing {} samples at {} Hz...", samples.len(), sample_rate);

    let mut queue = PlaybackQueue::default();
    queue.enqueue(samples, &mut port)?;
    queue.mark_turn_done();

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(message) = messages.recv().await {
            if let AudioMessage::Done { segment } = message
                && queue.finish_current(segment, &mut port)
            {
                return true;
            }
        }
        false
    })
    .await;

    graph.disconnect();

    if !matches!(drained, Ok(true)) {
        anyhow::bail!("playback did not complete");
    }

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}
