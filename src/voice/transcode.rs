//! Raw sink to container conversion

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

use super::scratch::{artifact_path, partial_path};
use crate::config::{Container, VoiceConfig};
use crate::{Error, Result};

/// Converts a raw little-endian s16 sink into a playable artifact
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Container this transcoder produces
    fn container(&self) -> Container;

    /// Convert `raw` and return the artifact path.
    ///
    /// The raw file is left in place; the caller deletes it. If the returned
    /// future is dropped before it resolves, nothing may appear at the
    /// artifact path afterwards.
    ///
    /// # Errors
    ///
    /// Returns `Error::Conversion` if the artifact cannot be produced
    async fn convert(&self, raw: &Path, sample_rate: u32, channels: u16) -> Result<PathBuf>;
}

/// Build the transcoder for the configured container
#[must_use]
pub fn from_config(config: &VoiceConfig) -> Box<dyn Transcoder> {
    match config.container {
        Container::Wav => Box::new(WavTranscoder),
        Container::Mp3 => Box::new(FfmpegTranscoder::new(
            config.ffmpeg_path.clone(),
            config.grace,
        )),
    }
}

/// Set once the `convert` call that started a blocking write is gone.
/// The writer holds the lock while it renames its output into place.
#[derive(Clone, Default)]
struct Abandoned(Arc<Mutex<bool>>);

struct AbandonOnDrop(Abandoned);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        *self.0.0.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }
}

/// In-process WAV writer
#[derive(Debug, Default, Clone, Copy)]
pub struct WavTranscoder;

#[async_trait]
impl Transcoder for WavTranscoder {
    fn container(&self) -> Container {
        Container::Wav
    }

    async fn convert(&self, raw: &Path, sample_rate: u32, channels: u16) -> Result<PathBuf> {
        let bytes = tokio::fs::read(raw)
            .await
            .map_err(|e| Error::Conversion(format!("failed to read {}: {e}", raw.display())))?;
        let out = artifact_path(raw, Container::Wav);
        let target = out.clone();
        let abandoned = Abandoned::default();
        let _guard = AbandonOnDrop(abandoned.clone());

        tokio::task::spawn_blocking(move || {
            write_wav(&target, &bytes, sample_rate, channels, &abandoned)
        })
        .await
        .map_err(|e| Error::Conversion(format!("wav writer panicked: {e}")))??;

        tracing::debug!(artifact = %out.display(), "wav artifact written");
        Ok(out)
    }
}

fn write_wav(
    path: &Path,
    pcm: &[u8],
    sample_rate: u32,
    channels: u16,
    abandoned: &Abandoned,
) -> Result<()> {
    if pcm.len() % 2 != 0 {
        return Err(Error::Conversion(format!(
            "raw sink has odd length {}",
            pcm.len()
        )));
    }

    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let partial = partial_path(path);
    let result = (|| -> std::result::Result<(), hound::Error> {
        let mut writer = hound::WavWriter::create(&partial, spec)?;
        for b in pcm.chunks_exact(2) {
            writer.write_sample(i16::from_le_bytes([b[0], b[1]]))?;
        }
        writer.finalize()
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&partial);
        return Err(Error::Conversion(e.to_string()));
    }

    let abandoned = abandoned.0.lock().unwrap_or_else(PoisonError::into_inner);
    if *abandoned {
        let _ = std::fs::remove_file(&partial);
        tracing::debug!(artifact = %path.display(), "conversion abandoned, output discarded");
        return Err(Error::Conversion("conversion abandoned".to_string()));
    }

    std::fs::rename(&partial, path).map_err(|e| {
        let _ = std::fs::remove_file(&partial);
        Error::Conversion(format!("failed to move artifact into place: {e}"))
    })
}

/// Transcodes through an ffmpeg subprocess
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: String,
    timeout: Duration,
}

impl FfmpegTranscoder {
    /// Create a transcoder running `program`, killed after `timeout`
    #[must_use]
    pub const fn new(program: String, timeout: Duration) -> Self {
        Self { program, timeout }
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    fn container(&self) -> Container {
        Container::Mp3
    }

    async fn convert(&self, raw: &Path, sample_rate: u32, channels: u16) -> Result<PathBuf> {
        let out = artifact_path(raw, Container::Mp3);

        let child = Command::new(&self.program)
            .args(["-hide_banner", "-loglevel", "error", "-y", "-f", "s16le"])
            .args(["-ar", &sample_rate.to_string()])
            .args(["-ac", &channels.to_string()])
            .arg("-i")
            .arg(raw)
            .arg(&out)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Conversion(format!("failed to spawn {}: {e}", self.program)))?;

        // the child is killed when this future drops
        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                let _ = tokio::fs::remove_file(&out).await;
                return Err(Error::Conversion(format!("ffmpeg failed: {e}")));
            }
            Err(_) => {
                let _ = tokio::fs::remove_file(&out).await;
                return Err(Error::Conversion(format!(
                    "ffmpeg timed out after {:?}",
                    self.timeout
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output.status.code().unwrap_or(-1);
            tracing::debug!(stderr = %stderr, code, "ffmpeg stderr");
            let _ = tokio::fs::remove_file(&out).await;
            return Err(Error::Conversion(format!("ffmpeg exited with code {code}")));
        }

        tracing::debug!(artifact = %out.display(), "mp3 artifact written");
        Ok(out)
    }
}
