//! Shared test utilities
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tempfile::TempDir;
use tokio::sync::mpsc;

use beacon_listen::command::{CommandContext, CommandDispatcher, CommandHandler, CommandName, UnhandledChat};
use beacon_listen::config::VoiceConfig;
use beacon_listen::voice::{
    ChannelRef, KeywordEngine, KeywordEngineFactory, KeywordIndex, LoopbackTransport,
    Transcriber, VoiceTransport, WakeEvent, samples_to_bytes,
};
use beacon_listen::{EpisodeReport, Error, RegistryBuilder, Result, VoiceSessionRegistry, WakeCallback};

/// Samples per frame of the marker engine
pub const FRAME: usize = 320;

/// First sample value that makes the marker engine match
pub const MARKER: i16 = i16::MAX;

/// Credential the marker factory rejects
pub const BAD_CREDENTIAL: &str = "bad-key";

/// A frame that triggers the marker engine
#[must_use]
pub fn marker_frame() -> Vec<u8> {
    let mut frame = vec![100i16; FRAME];
    frame[0] = MARKER;
    samples_to_bytes(&frame)
}

/// A frame of non-silent audio that does not trigger
#[must_use]
pub fn speech_frame() -> Vec<u8> {
    samples_to_bytes(&[1000i16; FRAME])
}

/// Engine that matches any frame starting with [`MARKER`]
struct MarkerEngine {
    lengths: Arc<Mutex<Vec<usize>>>,
    live: Arc<AtomicUsize>,
}

impl KeywordEngine for MarkerEngine {
    fn frame_length(&self) -> usize {
        FRAME
    }

    fn sample_rate(&self) -> u32 {
        16_000
    }

    fn process(&mut self, frame: &[i16]) -> Result<Option<KeywordIndex>> {
        self.lengths.lock().unwrap().push(frame.len());
        Ok((frame[0] == MARKER).then_some(0))
    }
}

impl Drop for MarkerEngine {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Factory for marker engines that tracks created and live handles
#[derive(Default)]
pub struct MarkerFactory {
    pub lengths: Arc<Mutex<Vec<usize>>>,
    pub created: AtomicUsize,
    pub live: Arc<AtomicUsize>,
}

impl MarkerFactory {
    /// Every frame length handed to any engine
    pub fn lengths(&self) -> Vec<usize> {
        self.lengths.lock().unwrap().clone()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl KeywordEngineFactory for MarkerFactory {
    fn create(
        &self,
        credential: &SecretString,
        _keyword_asset: Option<&Path>,
        _sensitivity: f32,
    ) -> Result<Box<dyn KeywordEngine>> {
        if credential.expose_secret() == BAD_CREDENTIAL {
            return Err(Error::KeywordEngine("invalid access key".to_string()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MarkerEngine {
            lengths: Arc::clone(&self.lengths),
            live: Arc::clone(&self.live),
        }))
    }
}

/// Transcriber returning fixed text, recording whether each artifact existed
pub struct FakeTranscriber {
    text: Option<String>,
    pub seen: Mutex<Vec<(PathBuf, bool)>>,
}

impl FakeTranscriber {
    pub fn new(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            text: None,
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, path: &Path) -> Result<String> {
        self.seen
            .lock()
            .unwrap()
            .push((path.to_path_buf(), path.exists()));
        self.text
            .clone()
            .ok_or_else(|| Error::Transcription("provider unavailable".to_string()))
    }
}

/// Handler that records the parameters it was called with
#[derive(Default)]
pub struct RecordingHandler {
    pub calls: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl CommandHandler for RecordingHandler {
    async fn handle(&self, ctx: &dyn CommandContext, params: &[String]) -> Result<String> {
        self.calls.lock().unwrap().push(params.to_vec());
        ctx.reply("ok").await?;
        Ok(format!("handled {}", params.join(" ")))
    }
}

/// A registry over a loopback transport with marker engines
pub struct Fixture {
    pub transport: Arc<LoopbackTransport>,
    pub engines: Arc<MarkerFactory>,
    pub transcriber: Arc<FakeTranscriber>,
    pub play: Arc<RecordingHandler>,
    pub registry: VoiceSessionRegistry,
    pub reports: mpsc::UnboundedReceiver<EpisodeReport>,
    pub wakes: Arc<Mutex<Vec<String>>>,
    pub scratch: TempDir,
}

/// Voice config with short timings and a private scratch dir
pub fn test_voice_config(scratch: &Path) -> VoiceConfig {
    VoiceConfig {
        connect_timeout: Duration::from_millis(200),
        record_duration: Duration::from_millis(300),
        grace: Duration::from_secs(1),
        refractory: Duration::from_secs(1),
        scratch_dir: scratch.to_path_buf(),
        ..VoiceConfig::default()
    }
}

/// Build a fixture whose transcriber yields `transcript`
pub fn fixture(transcript: &str) -> Fixture {
    fixture_with(Arc::new(FakeTranscriber::new(transcript)), |v| v)
}

/// Build a fixture with a custom transcriber and config tweaks
pub fn fixture_with(
    transcriber: Arc<FakeTranscriber>,
    tweak: impl FnOnce(VoiceConfig) -> VoiceConfig,
) -> Fixture {
    let scratch = tempfile::tempdir().unwrap();
    let transport = Arc::new(LoopbackTransport::new());
    let engines = Arc::new(MarkerFactory::default());
    let play = Arc::new(RecordingHandler::default());
    let (reports_tx, reports) = mpsc::unbounded_channel();

    let dispatcher = CommandDispatcher::new(Arc::new(UnhandledChat))
        .register(CommandName::Play, Arc::clone(&play) as Arc<dyn CommandHandler>);

    let registry = RegistryBuilder::new(
        Arc::clone(&transport) as Arc<dyn VoiceTransport>,
        Arc::clone(&transcriber) as Arc<dyn Transcriber>,
        Arc::new(dispatcher),
    )
    .engine_factory(Arc::clone(&engines) as Arc<dyn KeywordEngineFactory>)
    .voice_config(tweak(test_voice_config(scratch.path())))
    .reports(reports_tx)
    .build()
    .unwrap();

    Fixture {
        transport,
        engines,
        transcriber,
        play,
        registry,
        reports,
        wakes: Arc::new(Mutex::new(Vec::new())),
        scratch,
    }
}

impl Fixture {
    /// Callback that records the speaker of each accepted wake word
    pub fn on_wake(&self) -> WakeCallback {
        let wakes = Arc::clone(&self.wakes);
        Arc::new(move |_channel: &ChannelRef, wake: &WakeEvent| {
            wakes.lock().unwrap().push(wake.speaker.clone());
        })
    }

    /// Files left in the scratch directory
    pub fn scratch_files(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.scratch.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    }

    /// Announce `speaker` and wait until their keyword tap is open
    pub async fn begin_speaking(&self, channel: &ChannelRef, speaker: &str) {
        self.transport
            .start_speaking(channel, speaker)
            .await
            .unwrap();
        let transport = Arc::clone(&self.transport);
        assert!(
            wait_until(Duration::from_secs(1), || {
                transport.open_taps(channel, speaker) >= 1
            })
            .await,
            "{speaker} was never subscribed"
        );
    }

    /// Push `frame` to `speaker` every 20ms for `duration`
    pub async fn stream(
        &self,
        channel: &ChannelRef,
        speaker: &str,
        frame: &[u8],
        duration: Duration,
    ) {
        let started = Instant::now();
        while started.elapsed() < duration {
            let _ = self.transport.push_audio(channel, speaker, frame).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Wait for the next episode report
    pub async fn next_report(&mut self) -> EpisodeReport {
        tokio::time::timeout(Duration::from_secs(5), self.reports.recv())
            .await
            .expect("timed out waiting for episode report")
            .expect("report channel closed")
    }
}

/// Default credential accepted by the marker factory
pub fn credential() -> SecretString {
    SecretString::from("test-key")
}

/// Poll `check` until it holds or `limit` passes
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < limit {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
