//! Follow-up utterance recording
//!
//! After a wake word, one speaker's audio is captured for a fixed window
//! into a raw sink, then converted into a container artifact. The window is
//! timer-driven: a speaker going quiet does not end it early.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;

use super::decoder::{Codec, Decoder, samples_to_bytes};
use super::scratch;
use super::transcode::Transcoder;
use super::transport::{ConnectionHandle, RawAudioStream, VoiceTransport};
use crate::{Error, Result};

/// Sample rate of recording sinks
pub const RECORDING_SAMPLE_RATE: u32 = 16_000;

/// Channel count of recording sinks
pub const RECORDING_CHANNELS: u16 = 1;

/// Status of a recording job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Capturing audio into the sink
    Recording,
    /// Converting the sink into an artifact
    Converting,
    /// Artifact produced
    Complete,
    /// Window closed without decoded audio
    NoAudio,
    /// Cancelled, or failed to subscribe, write or convert
    Failed,
}

/// One wake-word triggered recording
#[derive(Debug, Clone, Serialize)]
pub struct RecordingJob {
    /// Speaker being recorded
    pub speaker: String,

    /// When recording started
    pub started_at: DateTime<Utc>,

    /// Configured window
    pub duration: Duration,

    /// Raw sink location
    pub sink_path: PathBuf,

    /// Current status
    pub status: JobStatus,
}

/// Resets the in-flight flag however `record` exits
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Records follow-up utterances for one session, one job at a time
pub struct RecordingSession {
    transport: Arc<dyn VoiceTransport>,
    connection: ConnectionHandle,
    codec: Arc<dyn Codec>,
    transcoder: Arc<dyn Transcoder>,
    scratch_dir: PathBuf,
    grace: Duration,
    in_flight: AtomicBool,
    job: Mutex<Option<RecordingJob>>,
}

impl RecordingSession {
    /// Create a recording session on a joined connection.
    ///
    /// `grace` bounds conversion after the window closes.
    #[must_use]
    pub fn new(
        transport: Arc<dyn VoiceTransport>,
        connection: ConnectionHandle,
        codec: Arc<dyn Codec>,
        transcoder: Arc<dyn Transcoder>,
        scratch_dir: PathBuf,
        grace: Duration,
    ) -> Self {
        Self {
            transport,
            connection,
            codec,
            transcoder,
            scratch_dir,
            grace,
            in_flight: AtomicBool::new(false),
            job: Mutex::new(None),
        }
    }

    /// Whether a job is in flight
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Most recent job, in flight or finished
    #[must_use]
    pub fn current_job(&self) -> Option<RecordingJob> {
        self.job.lock().ok().and_then(|job| job.clone())
    }

    /// Record `speaker` for `duration`, then convert the sink.
    ///
    /// Resolves within `duration` plus the grace period. The caller owns
    /// the returned artifact and deletes it once consumed.
    ///
    /// # Errors
    ///
    /// - `RecordingInProgress` if another job is in flight (that job is
    ///   left untouched)
    /// - `Connect` if the speaker's audio cannot be tapped
    /// - `NoAudioDetected` if nothing decoded during the window
    /// - `Conversion` if the artifact cannot be produced in time
    /// - `Cancelled` if `cancel` fires first; the sink is deleted
    pub async fn record(
        &self,
        speaker: &str,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            tracing::debug!(speaker, "recording rejected, another job is in flight");
            return Err(Error::RecordingInProgress(speaker.to_string()));
        }
        let _in_flight = InFlight(&self.in_flight);

        let sink_path = scratch::sink_path(&self.scratch_dir, speaker);
        self.set_job(Some(RecordingJob {
            speaker: speaker.to_string(),
            started_at: Utc::now(),
            duration,
            sink_path: sink_path.clone(),
            status: JobStatus::Recording,
        }));

        let result = self.run(speaker, duration, &sink_path, cancel).await;

        let status = match &result {
            Ok(_) => JobStatus::Complete,
            Err(Error::NoAudioDetected(_)) => JobStatus::NoAudio,
            Err(_) => JobStatus::Failed,
        };
        self.set_status(status);

        match &result {
            Ok(artifact) => {
                tracing::info!(speaker, artifact = %artifact.display(), "recording complete");
            }
            Err(e) => tracing::info!(speaker, error = %e, "recording ended without artifact"),
        }
        result
    }

    async fn run(
        &self,
        speaker: &str,
        duration: Duration,
        sink_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let stream = self
            .transport
            .subscribe(&self.connection, speaker)
            .map_err(|e| match e {
                Error::Connect(_) => e,
                other => Error::Connect(other.to_string()),
            })?;
        let decoder = self.codec.decoder(
            RECORDING_SAMPLE_RATE,
            RECORDING_CHANNELS,
            (RECORDING_SAMPLE_RATE / 50) as usize,
        )?;

        scratch::ensure_dir(&self.scratch_dir)?;
        let file = tokio::fs::File::create(sink_path).await?;
        let mut sink = BufWriter::new(file);

        tracing::info!(speaker, ?duration, sink = %sink_path.display(), "recording started");

        let captured = capture(
            stream,
            decoder,
            &mut sink,
            duration,
            cancel,
            speaker,
        )
        .await;

        let flushed = sink.shutdown().await;
        drop(sink);

        let has_audio = match (captured, flushed) {
            (Ok(has_audio), Ok(())) => has_audio,
            (Err(e), _) => {
                remove_quietly(sink_path).await;
                return Err(e);
            }
            (Ok(_), Err(e)) => {
                remove_quietly(sink_path).await;
                return Err(e.into());
            }
        };

        if !has_audio {
            remove_quietly(sink_path).await;
            return Err(Error::NoAudioDetected(speaker.to_string()));
        }

        self.set_status(JobStatus::Converting);
        let converted = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled("recording stopped during conversion".to_string())),
            res = tokio::time::timeout(
                self.grace,
                self.transcoder.convert(sink_path, RECORDING_SAMPLE_RATE, RECORDING_CHANNELS),
            ) => match res {
                Ok(Ok(path)) => Ok(path),
                Ok(Err(e @ Error::Conversion(_))) => Err(e),
                Ok(Err(e)) => Err(Error::Conversion(e.to_string())),
                Err(_) => Err(Error::Conversion(format!(
                    "conversion timed out after {:?}",
                    self.grace
                ))),
            },
        };

        if converted.is_err() {
            // a stalled or cancelled transcoder may have written part of it
            let artifact = scratch::artifact_path(sink_path, self.transcoder.container());
            remove_quietly(&artifact).await;
        }
        remove_quietly(sink_path).await;
        converted
    }

    fn set_job(&self, job: Option<RecordingJob>) {
        if let Ok(mut slot) = self.job.lock() {
            *slot = job;
        }
    }

    fn set_status(&self, status: JobStatus) {
        if let Ok(mut slot) = self.job.lock() {
            if let Some(job) = slot.as_mut() {
                job.status = status;
            }
        }
    }
}

/// Copy decoded audio into the sink until the window closes.
/// Returns whether any decoded bytes were written.
async fn capture<W>(
    mut stream: RawAudioStream,
    mut decoder: Box<dyn Decoder>,
    sink: &mut W,
    duration: Duration,
    cancel: &CancellationToken,
    speaker: &str,
) -> Result<bool>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let window = tokio::time::sleep(duration);
    tokio::pin!(window);

    let mut has_audio = false;
    let mut stream_open = true;
    let mut bytes_written = 0usize;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(Error::Cancelled("recording stopped".to_string()));
            }
            () = &mut window => break,
            chunk = stream.recv(), if stream_open => {
                let Some(raw) = chunk else {
                    tracing::trace!(speaker, "recording tap closed before window end");
                    stream_open = false;
                    continue;
                };

                let frames = match decoder.push(&raw) {
                    Ok(frames) => frames,
                    Err(e) => {
                        tracing::debug!(speaker, error = %e, "skipping undecodable chunk");
                        continue;
                    }
                };

                for pcm in frames.iter().filter(|f| !f.is_empty()) {
                    let bytes = samples_to_bytes(pcm);
                    sink.write_all(&bytes).await?;
                    bytes_written += bytes.len();
                    has_audio = true;
                }
            }
        }
    }

    tracing::debug!(speaker, bytes_written, "recording window closed");
    Ok(has_audio)
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove scratch file");
        }
    }
}
