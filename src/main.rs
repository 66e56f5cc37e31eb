use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use beacon_listen::command::{CommandDispatcher, UnhandledChat};
use beacon_listen::voice::{
    ChannelRef, LoopbackTransport, PcmCodec, SpeechToText, StaticTranscriber, Transcriber,
    VoiceTransport, WakeEvent,
};
use beacon_listen::{Config, RegistryBuilder, WakeCallback};

/// Beacon Listen - wake-word voice commands for group calls
#[derive(Parser)]
#[command(name = "beacon-listen", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse a transcript and print the intent as JSON
    Parse {
        /// Transcript text
        text: String,
    },
    /// Play a WAV file into a loopback session and print the episode report
    Simulate {
        /// 16-bit PCM WAV file
        #[arg(long)]
        wav: PathBuf,
        /// Speaker id
        #[arg(long, default_value = "local-user")]
        speaker: String,
        /// Voice channel id
        #[arg(long, default_value = "local-voice")]
        channel: String,
        /// Guild id
        #[arg(long, default_value = "local")]
        guild: String,
        /// Skip speech-to-text and use this transcript
        #[arg(long)]
        transcript: Option<String>,
    },
    /// Transcribe an artifact with the configured provider
    Transcribe {
        /// Audio file (wav or mp3)
        file: PathBuf,
    },
    /// Print the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,beacon_listen=info",
        1 => "info,beacon_listen=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Parse { text } => {
            let intent = beacon_listen::command::parse(&text);
            println!("{}", serde_json::to_string_pretty(&intent)?);
            Ok(())
        }
        Command::Simulate {
            wav,
            speaker,
            channel,
            guild,
            transcript,
        } => {
            let config = Config::load()?;
            simulate(
                config,
                &wav,
                &speaker,
                ChannelRef::new(guild, channel),
                transcript,
            )
            .await
        }
        Command::Transcribe { file } => {
            let config = Config::load()?;
            let stt = SpeechToText::from_config(&config.stt)?;
            let text = stt.transcribe(&file).await?;
            println!("{text}");
            Ok(())
        }
        Command::Config => {
            let config = Config::load()?;
            println!("{config:#?}");
            Ok(())
        }
    }
}

/// Samples of input audio pushed per chunk at the engine rate
const FRAME_SAMPLES: usize = 512;

/// Rate the keyword engine runs at
const ENGINE_RATE: u32 = 16_000;

async fn simulate(
    config: Config,
    wav: &Path,
    speaker: &str,
    channel: ChannelRef,
    transcript: Option<String>,
) -> anyhow::Result<()> {
    let reader = hound::WavReader::open(wav)
        .with_context(|| format!("failed to open {}", wav.display()))?;
    let spec = reader.spec();
    if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        anyhow::bail!("{} is not 16-bit PCM", wav.display());
    }
    let samples: Vec<i16> = reader.into_samples().collect::<Result<_, _>>()?;

    let transcriber: Arc<dyn Transcriber> = match transcript {
        Some(text) => Arc::new(StaticTranscriber::new(text)),
        None => Arc::new(SpeechToText::from_config(&config.stt)?),
    };
    let dispatcher = Arc::new(CommandDispatcher::new(Arc::new(UnhandledChat)).with_help());

    let transport = Arc::new(LoopbackTransport::new());
    let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
    let registry = RegistryBuilder::new(
        Arc::clone(&transport) as Arc<dyn VoiceTransport>,
        transcriber,
        dispatcher,
    )
    .codec(Arc::new(PcmCodec::new(spec.sample_rate, spec.channels)))
    .voice_config(config.voice.clone())
    .keyword_config(config.keyword.clone())
    .reports(reports_tx)
    .build()?;

    let credential = config
        .keyword
        .access_key
        .clone()
        .unwrap_or_else(|| SecretString::from("local"));
    let on_wake: WakeCallback = Arc::new(|channel: &ChannelRef, wake: &WakeEvent| {
        tracing::info!(channel = %channel, speaker = %wake.speaker, "wake word, recording");
    });
    registry.start(channel.clone(), on_wake, credential).await?;

    // Native-rate input must arrive in whole engine frames; anything else is
    // resampled and re-framed by the decoder, so 20ms chunks will do.
    let (chunk_frames, period) = if spec.sample_rate == ENGINE_RATE {
        (FRAME_SAMPLES, Duration::from_millis(32))
    } else {
        ((spec.sample_rate / 50) as usize, Duration::from_millis(20))
    };
    let chunk_samples = chunk_frames * usize::from(spec.channels);
    let mut ticker = tokio::time::interval(period);

    transport.start_speaking(&channel, speaker).await?;
    for chunk in samples.chunks(chunk_samples) {
        ticker.tick().await;
        let bytes = beacon_listen::voice::samples_to_bytes(chunk);
        transport.push_audio(&channel, speaker, &bytes).await?;
    }
    transport.stop_speaking(&channel, speaker).await?;

    let wait = config.voice.record_duration + config.voice.grace + config.stt.timeout;
    let report = tokio::time::timeout(wait, reports_rx.recv()).await;

    if let Some(stats) = registry.stats(&channel) {
        tracing::debug!(?stats, "session stats");
    }
    registry.shutdown_all().await;

    match report {
        Ok(Some(report)) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        _ => anyhow::bail!("no wake word detected in {}", wav.display()),
    }
}
