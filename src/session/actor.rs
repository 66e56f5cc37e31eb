//! Session actor
//!
//! Owns everything a listening channel needs and reacts to speaking
//! events, wake words and episode completion from a single task.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::SessionState;
use super::registry::WakeCallback;
use super::stats::{SessionStats, StatsSnapshot};
use crate::pipeline::{EpisodeOutcome, EpisodePipeline, EpisodeReport};
use crate::voice::{
    AudioSubscriptionManager, ChannelRef, ClosedSubscription, ConnectionHandle, RecordingJob,
    RecordingSession, SpeakingEvent, VoiceTransport, WakeEvent,
};

/// Registry-side handle on a running session
pub(crate) struct SessionHandle {
    pub channel: ChannelRef,
    cancel: CancellationToken,
    state: watch::Receiver<SessionState>,
    stats: Arc<SessionStats>,
    recorder: Arc<RecordingSession>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// The actor has finished teardown
    pub fn is_stopped(&self) -> bool {
        self.state() == SessionState::Stopped
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn recording_job(&self) -> Option<RecordingJob> {
        self.recorder.current_job()
    }

    /// Cancel every stage and wait for teardown to finish
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(channel = %self.channel, error = %e, "session task panicked");
        }
    }
}

/// Parts a session actor is assembled from
pub(crate) struct SessionParts {
    pub channel: ChannelRef,
    pub transport: Arc<dyn VoiceTransport>,
    pub connection: ConnectionHandle,
    pub events: mpsc::Receiver<SpeakingEvent>,
    pub manager: AudioSubscriptionManager,
    pub wake_rx: mpsc::UnboundedReceiver<WakeEvent>,
    pub closed_rx: mpsc::UnboundedReceiver<ClosedSubscription>,
    pub pipeline: EpisodePipeline,
    pub on_wake: WakeCallback,
    pub reports: Option<mpsc::UnboundedSender<EpisodeReport>>,
    pub refractory: Duration,
    pub stats: Arc<SessionStats>,
    pub cancel: CancellationToken,
}

struct SessionActor {
    channel: ChannelRef,
    transport: Arc<dyn VoiceTransport>,
    connection: ConnectionHandle,
    manager: AudioSubscriptionManager,
    pipeline: EpisodePipeline,
    on_wake: WakeCallback,
    reports: Option<mpsc::UnboundedSender<EpisodeReport>>,
    refractory: Duration,
    last_trigger: HashMap<String, Instant>,
    episode: Option<JoinHandle<()>>,
    done_tx: mpsc::UnboundedSender<()>,
    stats: Arc<SessionStats>,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
}

/// Spawn the actor for a joined channel
pub(crate) fn spawn(parts: SessionParts) -> SessionHandle {
    let (state_tx, state_rx) = watch::channel(SessionState::Listening);
    let (done_tx, done_rx) = mpsc::unbounded_channel();
    let recorder = Arc::clone(&parts.pipeline.recorder);

    let actor = SessionActor {
        channel: parts.channel.clone(),
        transport: parts.transport,
        connection: parts.connection,
        manager: parts.manager,
        pipeline: parts.pipeline,
        on_wake: parts.on_wake,
        reports: parts.reports,
        refractory: parts.refractory,
        last_trigger: HashMap::new(),
        episode: None,
        done_tx,
        stats: Arc::clone(&parts.stats),
        state: state_tx,
        cancel: parts.cancel.clone(),
    };

    let task = tokio::spawn(actor.run(parts.events, parts.wake_rx, parts.closed_rx, done_rx));

    SessionHandle {
        channel: parts.channel,
        cancel: parts.cancel,
        state: state_rx,
        stats: parts.stats,
        recorder,
        task,
    }
}

impl SessionActor {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<SpeakingEvent>,
        mut wake_rx: mpsc::UnboundedReceiver<WakeEvent>,
        mut closed_rx: mpsc::UnboundedReceiver<ClosedSubscription>,
        mut done_rx: mpsc::UnboundedReceiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                Some(()) = done_rx.recv() => self.on_episode_done().await,
                Some(closed) = closed_rx.recv() => {
                    self.manager.reap(&closed);
                }
                Some(wake) = wake_rx.recv() => self.on_wake(wake),
                event = events.recv() => match event {
                    Some(SpeakingEvent::Started(speaker)) => {
                        if let Err(e) = self.manager.on_speaking_start(&speaker) {
                            tracing::warn!(channel = %self.channel, speaker = %speaker, error = %e, "failed to open subscription");
                        }
                    }
                    Some(SpeakingEvent::Ended(speaker)) => {
                        self.manager.on_speaking_end(&speaker);
                    }
                    None => {
                        tracing::warn!(channel = %self.channel, "transport event stream closed, ending session");
                        self.cancel.cancel();
                        break;
                    }
                },
            }
        }

        self.teardown().await;
    }

    fn on_wake(&mut self, wake: WakeEvent) {
        let in_refractory = self
            .last_trigger
            .get(&wake.speaker)
            .is_some_and(|last| wake.detected_at.saturating_duration_since(*last) < self.refractory);

        if in_refractory {
            self.stats.record_ignored();
            tracing::debug!(channel = %self.channel, speaker = %wake.speaker, "detection inside refractory window, ignored");
            return;
        }

        if self.episode.is_some() {
            self.stats.record_ignored();
            tracing::debug!(channel = %self.channel, speaker = %wake.speaker, "episode in flight, detection ignored");
            return;
        }

        self.last_trigger
            .insert(wake.speaker.clone(), wake.detected_at);

        let callback = Arc::clone(&self.on_wake);
        let channel = &self.channel;
        if std::panic::catch_unwind(AssertUnwindSafe(|| callback(channel, &wake))).is_err() {
            tracing::warn!(channel = %self.channel, "wake-word callback panicked");
        }

        self.stats.record_episode_start();
        self.state.send_replace(SessionState::Recording);
        self.episode = Some(self.spawn_episode(wake));
    }

    fn spawn_episode(&self, wake: WakeEvent) -> JoinHandle<()> {
        let pipeline = self.pipeline.clone();
        let channel = self.channel.clone();
        let token = self.cancel.child_token();
        let reports = self.reports.clone();
        let stats = Arc::clone(&self.stats);
        let done = self.done_tx.clone();

        tokio::spawn(async move {
            let outcome = pipeline.run(&channel, &wake, &token).await;
            stats.record_episode_end(outcome.is_dispatched());

            match &outcome {
                EpisodeOutcome::Dispatched { intent, .. } => {
                    tracing::info!(channel = %channel, speaker = %wake.speaker, command = %intent.command, "episode dispatched");
                }
                EpisodeOutcome::Failed { stage, kind, error } => {
                    tracing::warn!(channel = %channel, speaker = %wake.speaker, ?stage, ?kind, error = %error, "episode failed");
                }
            }

            if let Some(reports) = reports {
                let _ = reports.send(EpisodeReport {
                    guild_id: channel.guild_id.clone(),
                    channel_id: channel.channel_id.clone(),
                    speaker: wake.speaker.clone(),
                    keyword_index: wake.keyword_index,
                    finished_at: chrono::Utc::now(),
                    outcome,
                });
            }

            let _ = done.send(());
        })
    }

    async fn on_episode_done(&mut self) {
        if let Some(episode) = self.episode.take() {
            if let Err(e) = episode.await {
                tracing::error!(channel = %self.channel, error = %e, "episode task panicked");
            }
        }
        self.state.send_replace(SessionState::Listening);
    }

    async fn teardown(mut self) {
        tracing::debug!(channel = %self.channel, "tearing down session");

        self.manager.shutdown().await;

        if let Some(episode) = self.episode.take() {
            if let Err(e) = episode.await {
                tracing::error!(channel = %self.channel, error = %e, "episode task panicked");
            }
        }

        if let Err(e) = self.transport.disconnect(self.connection.clone()).await {
            tracing::warn!(channel = %self.channel, error = %e, "transport disconnect failed");
        }

        self.state.send_replace(SessionState::Stopped);
        tracing::info!(channel = %self.channel, "session stopped");
    }
}
