//! Per-speaker keyword subscriptions
//!
//! While a session listens, every speaking user gets a decoder and a keyword
//! engine of their own, running on a task fed by the transport tap. A
//! failure inside one speaker's task closes only that subscription.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::decoder::{Codec, Decoder};
use super::keyword::{KeywordEngineFactory, KeywordIndex, KeywordSettings, KeywordSpotter};
use super::transport::{ConnectionHandle, RawAudioStream, VoiceTransport};
use crate::Result;
use crate::session::SessionStats;

/// A keyword match on one speaker's audio
#[derive(Debug, Clone)]
pub struct WakeEvent {
    /// Speaker whose audio matched
    pub speaker: String,

    /// Index of the matched keyword
    pub keyword_index: KeywordIndex,

    /// When the engine reported the match
    pub detected_at: Instant,
}

/// Why a subscription task ended on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The transport closed the speaker's tap
    StreamEnded,
    /// The decoder rejected a chunk
    Decode(String),
    /// The keyword engine failed on a frame
    Engine(String),
}

/// Notice sent by a subscription task that ended without being cancelled
#[derive(Debug, Clone)]
pub struct ClosedSubscription {
    /// Speaker the subscription belonged to
    pub speaker: String,

    /// Subscription id, so a stale notice never removes a newer subscription
    pub id: u64,

    /// Why it ended
    pub reason: CloseReason,
}

struct ActiveSubscription {
    id: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Channels a subscription task reports on
#[derive(Clone)]
struct Outlets {
    wake: mpsc::UnboundedSender<WakeEvent>,
    closed: mpsc::UnboundedSender<ClosedSubscription>,
    stats: Arc<SessionStats>,
}

/// Opens and closes keyword subscriptions for one session
pub struct AudioSubscriptionManager {
    transport: Arc<dyn VoiceTransport>,
    connection: ConnectionHandle,
    codec: Arc<dyn Codec>,
    factory: Arc<dyn KeywordEngineFactory>,
    settings: KeywordSettings,
    outlets: Outlets,
    cancel: CancellationToken,
    active: HashMap<String, ActiveSubscription>,
    retired: Vec<JoinHandle<()>>,
    next_id: u64,
}

impl AudioSubscriptionManager {
    /// Create a manager for one joined connection.
    ///
    /// Subscription tasks are cancelled together with `cancel`.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        transport: Arc<dyn VoiceTransport>,
        connection: ConnectionHandle,
        codec: Arc<dyn Codec>,
        factory: Arc<dyn KeywordEngineFactory>,
        settings: KeywordSettings,
        stats: Arc<SessionStats>,
        wake: mpsc::UnboundedSender<WakeEvent>,
        closed: mpsc::UnboundedSender<ClosedSubscription>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            connection,
            codec,
            factory,
            settings,
            outlets: Outlets {
                wake,
                closed,
                stats,
            },
            cancel,
            active: HashMap::new(),
            retired: Vec::new(),
            next_id: 0,
        }
    }

    /// Speakers with an open subscription
    #[must_use]
    pub fn speakers(&self) -> Vec<String> {
        let mut speakers: Vec<String> = self.active.keys().cloned().collect();
        speakers.sort();
        speakers
    }

    /// Whether `speaker` has an open subscription
    #[must_use]
    pub fn is_subscribed(&self, speaker: &str) -> bool {
        self.active.contains_key(speaker)
    }

    /// Handle a speaking-start event.
    ///
    /// Returns `Ok(false)` if the speaker already has a subscription.
    ///
    /// # Errors
    ///
    /// Returns error if the engine, decoder or tap cannot be opened; no
    /// subscription is left behind in that case
    pub fn on_speaking_start(&mut self, speaker: &str) -> Result<bool> {
        self.retired.retain(|task| !task.is_finished());

        if self.active.contains_key(speaker) {
            tracing::trace!(speaker, "already subscribed");
            return Ok(false);
        }

        let opened = self.open(speaker);
        if opened.is_err() {
            self.outlets.stats.record_subscription_failure();
        }
        let (spotter, decoder, stream) = opened?;

        self.next_id += 1;
        let id = self.next_id;
        let cancel = self.cancel.child_token();

        let task = tokio::spawn(run_subscription(
            speaker.to_string(),
            id,
            stream,
            decoder,
            spotter,
            cancel.clone(),
            self.outlets.clone(),
        ));

        self.outlets.stats.record_subscription();
        self.active
            .insert(speaker.to_string(), ActiveSubscription { id, cancel, task });

        tracing::debug!(channel = %self.connection.channel, speaker, id, "subscription opened");
        Ok(true)
    }

    /// Handle a speaking-end event. Returns whether a subscription was closed.
    pub fn on_speaking_end(&mut self, speaker: &str) -> bool {
        let Some(sub) = self.active.remove(speaker) else {
            return false;
        };

        sub.cancel.cancel();
        self.retired.push(sub.task);
        tracing::debug!(channel = %self.connection.channel, speaker, id = sub.id, "subscription closed");
        true
    }

    /// Forget a subscription whose task ended by itself
    pub fn reap(&mut self, closed: &ClosedSubscription) -> bool {
        let matches = self
            .active
            .get(&closed.speaker)
            .is_some_and(|sub| sub.id == closed.id);

        if matches {
            if let Some(sub) = self.active.remove(&closed.speaker) {
                self.retired.push(sub.task);
            }
            tracing::debug!(
                speaker = %closed.speaker,
                id = closed.id,
                reason = ?closed.reason,
                "subscription reaped"
            );
        }
        matches
    }

    /// Cancel every subscription and wait until each task has released its
    /// decoder and engine
    pub async fn shutdown(&mut self) {
        for sub in self.active.values() {
            sub.cancel.cancel();
        }

        let tasks = self
            .active
            .drain()
            .map(|(_, sub)| sub.task)
            .chain(self.retired.drain(..));

        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "subscription task panicked");
            }
        }
    }

    fn open(
        &self,
        speaker: &str,
    ) -> Result<(KeywordSpotter, Box<dyn Decoder>, RawAudioStream)> {
        let spotter = self.settings.create(self.factory.as_ref())?;
        let decoder = self
            .codec
            .decoder(spotter.sample_rate(), 1, spotter.frame_length())?;
        let stream = self.transport.subscribe(&self.connection, speaker)?;
        Ok((spotter, decoder, stream))
    }
}

/// Decode a speaker's audio and feed exact-length frames to their engine
async fn run_subscription(
    speaker: String,
    id: u64,
    mut stream: RawAudioStream,
    mut decoder: Box<dyn Decoder>,
    mut spotter: KeywordSpotter,
    cancel: CancellationToken,
    outlets: Outlets,
) {
    let reason = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break None,
            chunk = stream.recv() => {
                let Some(raw) = chunk else {
                    break Some(CloseReason::StreamEnded);
                };

                let frames = match decoder.push(&raw) {
                    Ok(frames) => frames,
                    Err(e) => {
                        tracing::warn!(speaker = %speaker, error = %e, "decode failed, closing subscription");
                        break Some(CloseReason::Decode(e.to_string()));
                    }
                };

                if let ControlFlow::Break(reason) = frames
                    .iter()
                    .try_for_each(|frame| spot(&speaker, &mut spotter, frame, &outlets))
                {
                    break reason;
                }
            }
        }
    };

    drop(spotter);
    drop(decoder);

    if let Some(reason) = reason {
        let _ = outlets.closed.send(ClosedSubscription {
            speaker,
            id,
            reason,
        });
    }
}

/// Run one decoded frame through the speaker's engine.
/// Breaks when the subscription should close.
fn spot(
    speaker: &str,
    spotter: &mut KeywordSpotter,
    frame: &[i16],
    outlets: &Outlets,
) -> ControlFlow<Option<CloseReason>> {
    if frame.is_empty() {
        return ControlFlow::Continue(());
    }

    if !spotter.accepts(frame) {
        let dropped = outlets.stats.record_dropped();
        tracing::debug!(
            speaker,
            len = frame.len(),
            required = spotter.frame_length(),
            dropped,
            "frame size mismatch, dropped"
        );
        return ControlFlow::Continue(());
    }

    outlets.stats.record_frame();
    match spotter.process(frame) {
        Ok(Some(keyword_index)) => {
            outlets.stats.record_detection();
            tracing::info!(speaker, keyword_index, "wake word detected");
            let event = WakeEvent {
                speaker: speaker.to_string(),
                keyword_index,
                detected_at: Instant::now(),
            };
            if outlets.wake.send(event).is_err() {
                return ControlFlow::Break(None);
            }
            ControlFlow::Continue(())
        }
        Ok(None) => ControlFlow::Continue(()),
        Err(e) => {
            tracing::warn!(speaker, error = %e, "keyword engine failed, closing subscription");
            ControlFlow::Break(Some(CloseReason::Engine(e.to_string())))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Mutex;

    use secrecy::SecretString;

    use super::*;
    use crate::Error;
    use crate::voice::decoder::{PcmCodec, samples_to_bytes};
    use crate::voice::keyword::KeywordEngine;
    use crate::voice::loopback::LoopbackTransport;
    use crate::voice::transport::ChannelRef;

    fn channel() -> ChannelRef {
        ChannelRef::new("g", "c")
    }

    /// Matches on every frame whose first sample is `i16::MAX`
    struct MarkerEngine {
        lengths: Arc<Mutex<Vec<usize>>>,
    }

    impl KeywordEngine for MarkerEngine {
        fn frame_length(&self) -> usize {
            8
        }

        fn sample_rate(&self) -> u32 {
            16_000
        }

        fn process(&mut self, frame: &[i16]) -> Result<Option<KeywordIndex>> {
            self.lengths.lock().unwrap().push(frame.len());
            Ok((frame[0] == i16::MAX).then_some(0))
        }
    }

    #[derive(Default)]
    struct MarkerFactory {
        lengths: Arc<Mutex<Vec<usize>>>,
        created: Mutex<usize>,
    }

    impl KeywordEngineFactory for MarkerFactory {
        fn create(
            &self,
            _credential: &SecretString,
            _asset: Option<&Path>,
            _sensitivity: f32,
        ) -> Result<Box<dyn KeywordEngine>> {
            *self.created.lock().unwrap() += 1;
            Ok(Box::new(MarkerEngine {
                lengths: Arc::clone(&self.lengths),
            }))
        }
    }

    struct Harness {
        transport: Arc<LoopbackTransport>,
        factory: Arc<MarkerFactory>,
        manager: AudioSubscriptionManager,
        wake_rx: mpsc::UnboundedReceiver<WakeEvent>,
        closed_rx: mpsc::UnboundedReceiver<ClosedSubscription>,
        stats: Arc<SessionStats>,
    }

    async fn harness() -> Harness {
        let transport = Arc::new(LoopbackTransport::new());
        let conn = transport.join(&channel()).await.unwrap();
        let factory = Arc::new(MarkerFactory::default());
        let stats = Arc::new(SessionStats::default());
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();

        let manager = AudioSubscriptionManager::new(
            Arc::clone(&transport) as Arc<dyn VoiceTransport>,
            conn.handle,
            Arc::new(PcmCodec::new(16_000, 1)),
            Arc::clone(&factory) as Arc<dyn KeywordEngineFactory>,
            KeywordSettings {
                credential: SecretString::from("test"),
                asset: None,
                sensitivity: 0.5,
            },
            Arc::clone(&stats),
            wake_tx,
            closed_tx,
            CancellationToken::new(),
        );

        Harness {
            transport,
            factory,
            manager,
            wake_rx,
            closed_rx,
            stats,
        }
    }

    #[tokio::test]
    async fn test_double_start_is_ignored() {
        let mut h = harness().await;

        assert!(h.manager.on_speaking_start("alice").unwrap());
        assert!(!h.manager.on_speaking_start("alice").unwrap());
        assert_eq!(*h.factory.created.lock().unwrap(), 1);
        assert_eq!(h.transport.open_taps(&channel(), "alice"), 1);
    }

    #[tokio::test]
    async fn test_mismatched_frames_never_reach_engine() {
        let mut h = harness().await;
        h.manager.on_speaking_start("alice").unwrap();

        let mut marker = vec![0i16; 8];
        marker[0] = i16::MAX;
        h.transport
            .push_audio(&channel(), "alice", &samples_to_bytes(&[1; 5]))
            .await
            .unwrap();
        h.transport
            .push_audio(&channel(), "alice", &samples_to_bytes(&marker))
            .await
            .unwrap();

        let event = h.wake_rx.recv().await.unwrap();
        assert_eq!(event.speaker, "alice");
        assert_eq!(*h.factory.lengths.lock().unwrap(), vec![8]);
        assert_eq!(h.stats.snapshot().frames_dropped, 1);
        assert!(h.manager.is_subscribed("alice"));
    }

    #[tokio::test]
    async fn test_decode_error_closes_only_that_speaker() {
        let mut h = harness().await;
        h.manager.on_speaking_start("alice").unwrap();
        h.manager.on_speaking_start("bob").unwrap();

        h.transport.push_audio(&channel(), "alice", &[1, 2, 3]).await.unwrap();

        let closed = h.closed_rx.recv().await.unwrap();
        assert_eq!(closed.speaker, "alice");
        assert!(matches!(closed.reason, CloseReason::Decode(_)));
        assert!(h.manager.reap(&closed));
        assert_eq!(h.manager.speakers(), vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn test_open_failure_leaves_nothing_behind() {
        let mut h = harness().await;
        h.transport.disconnect(h.manager.connection.clone()).await.unwrap();

        let err = h.manager.on_speaking_start("alice").unwrap_err();
        assert!(matches!(err, Error::Connect(_)));
        assert!(!h.manager.is_subscribed("alice"));
        assert_eq!(h.stats.snapshot().subscriptions_failed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_taps() {
        let mut h = harness().await;
        h.manager.on_speaking_start("alice").unwrap();
        h.manager.on_speaking_start("bob").unwrap();
        assert!(h.manager.on_speaking_end("bob"));

        h.manager.shutdown().await;

        assert!(h.manager.speakers().is_empty());
        assert_eq!(h.transport.open_taps(&channel(), "alice"), 0);
        assert_eq!(h.transport.open_taps(&channel(), "bob"), 0);
    }
}
