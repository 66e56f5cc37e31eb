//! Wake-word episodes
//!
//! One episode runs record → transcribe → parse → dispatch for a single
//! detection and always ends in an [`EpisodeOutcome`]. Every stage is bound
//! to the session's cancellation token.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::Error;
use crate::command::{self, CommandDispatcher, Intent, Reply, VoiceReplyContext};
use crate::voice::{ChannelRef, KeywordIndex, RecordingSession, Transcriber, WakeEvent};

/// Pipeline stage an episode failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Capturing and converting the follow-up utterance
    Recording,
    /// Speech-to-text
    Transcription,
    /// Command handler
    Dispatch,
}

/// Failure classes an episode can end in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Speaker's audio could not be tapped
    Connect,
    /// Nothing was said during the window
    NoAudio,
    /// Another recording was in flight
    Busy,
    /// Artifact conversion failed
    Conversion,
    /// Speech-to-text failed
    Transcription,
    /// Command handler failed
    Dispatch,
    /// The session stopped
    Cancelled,
    /// Anything else (io, decoder setup)
    Other,
}

impl From<&Error> for FailureKind {
    fn from(e: &Error) -> Self {
        match e {
            Error::Connect(_) => Self::Connect,
            Error::NoAudioDetected(_) => Self::NoAudio,
            Error::RecordingInProgress(_) => Self::Busy,
            Error::Conversion(_) => Self::Conversion,
            Error::Transcription(_) => Self::Transcription,
            Error::Dispatch(_) => Self::Dispatch,
            Error::Cancelled(_) => Self::Cancelled,
            _ => Self::Other,
        }
    }
}

/// Terminal result of one episode
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum EpisodeOutcome {
    /// A handler replied
    Dispatched {
        /// Parsed intent
        intent: Intent,
        /// Handler reply
        reply: String,
    },
    /// The episode stopped at `stage`
    Failed {
        /// Failing stage
        stage: Stage,
        /// Failure class
        kind: FailureKind,
        /// Human-readable cause
        error: String,
    },
}

impl EpisodeOutcome {
    fn failed(stage: Stage, error: &Error) -> Self {
        Self::Failed {
            stage,
            kind: FailureKind::from(error),
            error: error.to_string(),
        }
    }

    /// Whether a handler replied
    #[must_use]
    pub const fn is_dispatched(&self) -> bool {
        matches!(self, Self::Dispatched { .. })
    }
}

/// An outcome with the channel and speaker it belongs to
#[derive(Debug, Clone, Serialize)]
pub struct EpisodeReport {
    /// Guild/group identifier
    pub guild_id: String,

    /// Voice channel identifier
    pub channel_id: String,

    /// Speaker who said the wake word
    pub speaker: String,

    /// Matched keyword
    pub keyword_index: KeywordIndex,

    /// When the episode ended
    pub finished_at: DateTime<Utc>,

    /// Terminal result
    pub outcome: EpisodeOutcome,
}

/// Everything an episode needs, shared by a session's episodes
#[derive(Clone)]
pub struct EpisodePipeline {
    /// Session recorder
    pub recorder: Arc<RecordingSession>,

    /// Speech-to-text collaborator
    pub transcriber: Arc<dyn Transcriber>,

    /// Command dispatcher
    pub dispatcher: Arc<CommandDispatcher>,

    /// Where handler replies go; logged when absent
    pub replies: Option<mpsc::UnboundedSender<Reply>>,

    /// Follow-up recording window
    pub record_duration: Duration,
}

impl EpisodePipeline {
    /// Run one episode for `wake` to its terminal outcome
    pub async fn run(
        &self,
        channel: &ChannelRef,
        wake: &WakeEvent,
        cancel: &CancellationToken,
    ) -> EpisodeOutcome {
        let speaker = wake.speaker.as_str();

        let artifact = match self
            .recorder
            .record(speaker, self.record_duration, cancel)
            .await
        {
            Ok(path) => path,
            Err(e) => return EpisodeOutcome::failed(Stage::Recording, &e),
        };

        let transcribed = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled("stopped during transcription".to_string())),
            res = self.transcriber.transcribe(&artifact) => res,
        };
        remove_artifact(&artifact).await;

        let transcript = match transcribed {
            Ok(text) => text,
            Err(e) => return EpisodeOutcome::failed(Stage::Transcription, &e),
        };

        let intent = command::parse(&transcript);
        tracing::info!(
            channel = %channel,
            speaker,
            command = %intent.command,
            parameters = ?intent.parameters,
            "intent parsed"
        );

        let ctx = match &self.replies {
            Some(tx) => VoiceReplyContext::new(channel.clone(), speaker, tx.clone()),
            None => VoiceReplyContext::logging(channel.clone(), speaker),
        };

        let dispatched = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled("stopped during dispatch".to_string())),
            res = self.dispatcher.dispatch(&intent, &ctx) => res,
        };

        match dispatched {
            Ok(reply) => EpisodeOutcome::Dispatched { intent, reply },
            Err(e) => EpisodeOutcome::failed(Stage::Dispatch, &e),
        }
    }
}

async fn remove_artifact(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!(artifact = %path.display(), error = %e, "failed to remove artifact");
    }
}
