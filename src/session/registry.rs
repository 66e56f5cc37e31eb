//! Process-wide registry of listening sessions

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use secrecy::SecretString;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::SessionState;
use super::actor::{self, SessionHandle, SessionParts};
use super::stats::{SessionStats, StatsSnapshot};
use crate::command::{CommandDispatcher, Reply};
use crate::config::{KeywordConfig, VoiceConfig};
use crate::pipeline::{EpisodePipeline, EpisodeReport};
use crate::voice::{
    AudioSubscriptionManager, ChannelRef, Codec, EnergyEngineFactory, KeywordEngineFactory,
    KeywordSettings, PcmCodec, RECORDING_SAMPLE_RATE, RecordingJob, RecordingSession, Transcoder,
    Transcriber, VoiceTransport, WakeEvent, scratch, transcode,
};
use crate::{Error, Result};

/// Called on every accepted wake word, before recording starts
pub type WakeCallback = Arc<dyn Fn(&ChannelRef, &WakeEvent) + Send + Sync>;

enum Slot {
    /// `start` is joining the transport
    Starting,
    /// Listening
    Active(SessionHandle),
    /// `stop` is tearing the session down
    Stopping,
}

impl Slot {
    /// Listening, and the actor has not ended on its own
    fn is_live(&self) -> bool {
        matches!(self, Self::Active(handle) if !handle.is_stopped())
    }

    /// The actor ended without `stop`, e.g. the transport dropped the channel
    fn is_ended(&self) -> bool {
        matches!(self, Self::Active(handle) if handle.is_stopped())
    }
}

type Slots = Mutex<HashMap<ChannelRef, Slot>>;

/// Removes a `Starting`/`Stopping` slot however the owning call exits
struct PendingSlot<'a> {
    slots: &'a Slots,
    channel: ChannelRef,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        let mut slots = lock(self.slots);
        if !matches!(slots.get(&self.channel), Some(Slot::Active(_))) {
            slots.remove(&self.channel);
        }
    }
}

fn lock(slots: &Slots) -> MutexGuard<'_, HashMap<ChannelRef, Slot>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builder for [`VoiceSessionRegistry`]
pub struct RegistryBuilder {
    transport: Arc<dyn VoiceTransport>,
    transcriber: Arc<dyn Transcriber>,
    dispatcher: Arc<CommandDispatcher>,
    codec: Arc<dyn Codec>,
    engines: Arc<dyn KeywordEngineFactory>,
    transcoder: Option<Arc<dyn Transcoder>>,
    voice: VoiceConfig,
    keyword: KeywordConfig,
    reports: Option<mpsc::UnboundedSender<EpisodeReport>>,
    replies: Option<mpsc::UnboundedSender<Reply>>,
}

impl RegistryBuilder {
    /// Start a builder with the energy keyword engine, a 16kHz mono PCM
    /// codec and default configuration
    #[must_use]
    pub fn new(
        transport: Arc<dyn VoiceTransport>,
        transcriber: Arc<dyn Transcriber>,
        dispatcher: Arc<CommandDispatcher>,
    ) -> Self {
        Self {
            transport,
            transcriber,
            dispatcher,
            codec: Arc::new(PcmCodec::new(RECORDING_SAMPLE_RATE, 1)),
            engines: Arc::new(EnergyEngineFactory),
            transcoder: None,
            voice: VoiceConfig::default(),
            keyword: KeywordConfig::default(),
            reports: None,
            replies: None,
        }
    }

    /// Transport audio codec
    #[must_use]
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Keyword engine factory
    #[must_use]
    pub fn engine_factory(mut self, engines: Arc<dyn KeywordEngineFactory>) -> Self {
        self.engines = engines;
        self
    }

    /// Transcoder; defaults to the one for the configured container
    #[must_use]
    pub fn transcoder(mut self, transcoder: Arc<dyn Transcoder>) -> Self {
        self.transcoder = Some(transcoder);
        self
    }

    /// Voice configuration
    #[must_use]
    pub fn voice_config(mut self, voice: VoiceConfig) -> Self {
        self.voice = voice;
        self
    }

    /// Keyword engine configuration
    #[must_use]
    pub fn keyword_config(mut self, keyword: KeywordConfig) -> Self {
        self.keyword = keyword;
        self
    }

    /// Receive a report for every finished episode
    #[must_use]
    pub fn reports(mut self, reports: mpsc::UnboundedSender<EpisodeReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// Receive handler replies
    #[must_use]
    pub fn replies(mut self, replies: mpsc::UnboundedSender<Reply>) -> Self {
        self.replies = Some(replies);
        self
    }

    /// Prepare the scratch directory and build the registry
    ///
    /// # Errors
    ///
    /// Returns error if the scratch directory cannot be created
    pub fn build(self) -> Result<VoiceSessionRegistry> {
        scratch::ensure_dir(&self.voice.scratch_dir)?;
        if let Err(e) = scratch::sweep(&self.voice.scratch_dir) {
            tracing::warn!(error = %e, "failed to sweep scratch directory");
        }

        let transcoder = self
            .transcoder
            .unwrap_or_else(|| Arc::from(transcode::from_config(&self.voice)));

        tracing::debug!(
            transport = self.transport.name(),
            scratch = %self.voice.scratch_dir.display(),
            "voice session registry ready"
        );

        Ok(VoiceSessionRegistry {
            transport: self.transport,
            transcriber: self.transcriber,
            dispatcher: self.dispatcher,
            codec: self.codec,
            engines: self.engines,
            transcoder,
            voice: self.voice,
            keyword: self.keyword,
            reports: self.reports,
            replies: self.replies,
            slots: Mutex::new(HashMap::new()),
        })
    }
}

/// Owns every listening session, at most one per channel.
///
/// Sessions are keyed by guild and channel together; channel ids are not
/// assumed to be unique across guilds.
pub struct VoiceSessionRegistry {
    transport: Arc<dyn VoiceTransport>,
    transcriber: Arc<dyn Transcriber>,
    dispatcher: Arc<CommandDispatcher>,
    codec: Arc<dyn Codec>,
    engines: Arc<dyn KeywordEngineFactory>,
    transcoder: Arc<dyn Transcoder>,
    voice: VoiceConfig,
    keyword: KeywordConfig,
    reports: Option<mpsc::UnboundedSender<EpisodeReport>>,
    replies: Option<mpsc::UnboundedSender<Reply>>,
    slots: Slots,
}

impl VoiceSessionRegistry {
    /// Start listening in `channel`.
    ///
    /// Returns once the transport is joined and speaking events are being
    /// handled.
    ///
    /// # Errors
    ///
    /// - `AlreadyListening` if a session is listening, starting or stopping
    ///   in the channel. A session that ended on its own is replaced.
    /// - `KeywordEngine` if the engine rejects the credential
    /// - `Connect` if joining fails or exceeds the connection timeout
    pub async fn start(
        &self,
        channel: ChannelRef,
        on_wake: WakeCallback,
        credential: SecretString,
    ) -> Result<()> {
        {
            let mut slots = lock(&self.slots);
            match slots.get(&channel) {
                Some(slot) if slot.is_ended() => {
                    tracing::debug!(channel = %channel, "replacing ended session");
                }
                Some(_) => {
                    tracing::debug!(channel = %channel, "start rejected, already listening");
                    return Err(Error::AlreadyListening(channel.to_string()));
                }
                None => {}
            }
            slots.insert(channel.clone(), Slot::Starting);
        }
        let _pending = PendingSlot {
            slots: &self.slots,
            channel: channel.clone(),
        };

        let handle = self.open(channel.clone(), on_wake, credential).await?;
        tracing::info!(channel = %handle.channel, transport = self.transport.name(), "listening");
        lock(&self.slots).insert(channel, Slot::Active(handle));
        Ok(())
    }

    async fn open(
        &self,
        channel: ChannelRef,
        on_wake: WakeCallback,
        credential: SecretString,
    ) -> Result<SessionHandle> {
        let settings = KeywordSettings {
            credential,
            asset: self.keyword.asset_path.clone(),
            sensitivity: self.keyword.sensitivity,
        };
        // reject a bad credential before joining
        drop(settings.create(self.engines.as_ref())?);

        let connection = match timeout(self.voice.connect_timeout, self.transport.join(&channel)).await
        {
            Ok(Ok(connection)) => connection,
            Ok(Err(Error::Connect(reason))) => return Err(Error::Connect(reason)),
            Ok(Err(e)) => return Err(Error::Connect(e.to_string())),
            Err(_) => {
                return Err(Error::Connect(format!(
                    "timed out joining {channel} after {:?}",
                    self.voice.connect_timeout
                )));
            }
        };

        let stats = Arc::new(SessionStats::default());
        let cancel = CancellationToken::new();
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();

        let manager = AudioSubscriptionManager::new(
            Arc::clone(&self.transport),
            connection.handle.clone(),
            Arc::clone(&self.codec),
            Arc::clone(&self.engines),
            settings,
            Arc::clone(&stats),
            wake_tx,
            closed_tx,
            cancel.clone(),
        );

        let recorder = Arc::new(RecordingSession::new(
            Arc::clone(&self.transport),
            connection.handle.clone(),
            Arc::clone(&self.codec),
            Arc::clone(&self.transcoder),
            self.voice.scratch_dir.clone(),
            self.voice.grace,
        ));

        let pipeline = EpisodePipeline {
            recorder,
            transcriber: Arc::clone(&self.transcriber),
            dispatcher: Arc::clone(&self.dispatcher),
            replies: self.replies.clone(),
            record_duration: self.voice.record_duration,
        };

        Ok(actor::spawn(SessionParts {
            channel,
            transport: Arc::clone(&self.transport),
            connection: connection.handle,
            events: connection.events,
            manager,
            wake_rx,
            closed_rx,
            pipeline,
            on_wake,
            reports: self.reports.clone(),
            refractory: self.voice.refractory,
            stats,
            cancel,
        }))
    }

    /// Stop listening in a channel.
    ///
    /// Cancels subscriptions and any episode in flight, releases the keyword
    /// engines and leaves the channel before returning.
    ///
    /// # Errors
    ///
    /// Returns `NotListening` if the channel has no active session. A
    /// session that already ended on its own is cleared and also reported
    /// as `NotListening`.
    pub async fn stop(&self, channel: &ChannelRef) -> Result<()> {
        let (handle, ended) = {
            let mut slots = lock(&self.slots);
            match slots.remove(channel) {
                Some(Slot::Active(handle)) if handle.is_stopped() => (handle, true),
                Some(Slot::Active(handle)) => {
                    slots.insert(channel.clone(), Slot::Stopping);
                    (handle, false)
                }
                Some(other) => {
                    slots.insert(channel.clone(), other);
                    return Err(Error::NotListening(channel.to_string()));
                }
                None => return Err(Error::NotListening(channel.to_string())),
            }
        };

        if ended {
            handle.stop().await;
            tracing::debug!(channel = %channel, "cleared ended session");
            return Err(Error::NotListening(channel.to_string()));
        }

        let _pending = PendingSlot {
            slots: &self.slots,
            channel: channel.clone(),
        };

        handle.stop().await;
        Ok(())
    }

    /// Stop every session
    pub async fn shutdown_all(&self) {
        let channels: Vec<ChannelRef> = lock(&self.slots)
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Active(_)))
            .map(|(channel, _)| channel.clone())
            .collect();

        let stops = channels.iter().map(|channel| self.stop(channel));
        for result in futures::future::join_all(stops).await {
            if let Err(e) = result {
                tracing::debug!(error = %e, "session already gone during shutdown");
            }
        }
    }

    /// Whether a session is listening in the channel
    #[must_use]
    pub fn is_listening(&self, channel: &ChannelRef) -> bool {
        lock(&self.slots).get(channel).is_some_and(Slot::is_live)
    }

    /// Session state, if a session is active.
    ///
    /// A session whose transport went away reports `Stopped` until the
    /// channel is stopped or started again.
    #[must_use]
    pub fn state(&self, channel: &ChannelRef) -> Option<SessionState> {
        match lock(&self.slots).get(channel) {
            Some(Slot::Active(handle)) => Some(handle.state()),
            _ => None,
        }
    }

    /// Session counters, if a session is active
    #[must_use]
    pub fn stats(&self, channel: &ChannelRef) -> Option<StatsSnapshot> {
        match lock(&self.slots).get(channel) {
            Some(Slot::Active(handle)) => Some(handle.stats()),
            _ => None,
        }
    }

    /// Latest recording job of a session
    #[must_use]
    pub fn recording_job(&self, channel: &ChannelRef) -> Option<RecordingJob> {
        match lock(&self.slots).get(channel) {
            Some(Slot::Active(handle)) => handle.recording_job(),
            _ => None,
        }
    }

    /// Channels with a listening session
    #[must_use]
    pub fn channels(&self) -> Vec<ChannelRef> {
        let mut channels: Vec<ChannelRef> = lock(&self.slots)
            .iter()
            .filter(|(_, slot)| slot.is_live())
            .map(|(channel, _)| channel.clone())
            .collect();
        channels.sort_by(|a, b| {
            (&a.guild_id, &a.channel_id).cmp(&(&b.guild_id, &b.channel_id))
        });
        channels
    }

    /// Voice configuration in effect
    #[must_use]
    pub const fn voice_config(&self) -> &VoiceConfig {
        &self.voice
    }
}
