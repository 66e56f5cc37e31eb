//! Speech-to-text (STT) processing

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::config::{SttConfig, SttProviderKind};
use crate::{Error, Result};

/// Turns a recorded artifact into transcript text
///
/// Implementations never delete the artifact; the caller owns cleanup.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe the artifact at `path`
    ///
    /// # Errors
    ///
    /// Returns `Error::Transcription` on provider failure, timeout or an
    /// empty transcript
    async fn transcribe(&self, path: &Path) -> Result<String>;
}

/// Response from OpenAI Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Response from Deepgram transcription API
#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

/// HTTP speech-to-text client
pub struct SpeechToText {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    provider: SttProviderKind,
    timeout: Duration,
}

impl SpeechToText {
    /// Create a new STT instance using `OpenAI` Whisper
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_whisper(api_key: SecretString, model: String, timeout: Duration) -> Result<Self> {
        Self::new(SttProviderKind::Whisper, api_key, model, timeout)
    }

    /// Create a new STT instance using Deepgram
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_deepgram(api_key: SecretString, model: String, timeout: Duration) -> Result<Self> {
        Self::new(SttProviderKind::Deepgram, api_key, model, timeout)
    }

    /// Create the client selected by configuration
    ///
    /// # Errors
    ///
    /// Returns error if the provider's API key is not configured
    pub fn from_config(config: &SttConfig) -> Result<Self> {
        let key = match config.provider {
            SttProviderKind::Whisper => config.openai_key.clone(),
            SttProviderKind::Deepgram => config.deepgram_key.clone(),
        };
        let key = key.ok_or_else(|| {
            Error::Config(format!("no API key configured for {:?}", config.provider))
        })?;

        Self::new(config.provider, key, config.model.clone(), config.timeout)
    }

    fn new(
        provider: SttProviderKind,
        api_key: SecretString,
        model: String,
        timeout: Duration,
    ) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config(format!("{provider:?} API key required")));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            model,
            provider,
            timeout,
        })
    }

    /// Transcribe using OpenAI Whisper
    async fn transcribe_whisper(&self, audio: Vec<u8>, file_name: String, mime: &str) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), "starting Whisper transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio)
                    .file_name(file_name)
                    .mime_str(mime)?,
            )
            .text("model", self.model.clone());

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/transcriptions")
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transcription(format!(
                "Whisper API error {status}: {body}"
            )));
        }

        let result: WhisperResponse = response.json().await?;
        Ok(result.text)
    }

    /// Transcribe using Deepgram
    async fn transcribe_deepgram(&self, audio: Vec<u8>, mime: &str) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), "starting Deepgram transcription");

        let url = format!(
            "https://api.deepgram.com/v1/listen?model={}&punctuate=true",
            self.model
        );

        let response = self
            .client
            .post(&url)
            .header(
                "Authorization",
                format!("Token {}", self.api_key.expose_secret()),
            )
            .header("Content-Type", mime)
            .body(audio)
            .send()
            .await?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transcription(format!(
                "Deepgram API error {status}: {body}"
            )));
        }

        let result: DeepgramResponse = response.json().await?;

        Ok(result
            .results
            .channels
            .first()
            .and_then(|c| c.alternatives.first())
            .map(|a| a.transcript.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl Transcriber for SpeechToText {
    async fn transcribe(&self, path: &Path) -> Result<String> {
        let audio = tokio::fs::read(path).await.map_err(|e| {
            Error::Transcription(format!("failed to read {}: {e}", path.display()))
        })?;
        let mime = mime_for(path);
        let file_name = path
            .file_name()
            .map_or_else(|| "audio.wav".to_string(), |n| n.to_string_lossy().into_owned());

        let result = match self.provider {
            SttProviderKind::Whisper => self.transcribe_whisper(audio, file_name, mime).await,
            SttProviderKind::Deepgram => self.transcribe_deepgram(audio, mime).await,
        };

        let text = result.map_err(|e| match e {
            Error::Http(e) if e.is_timeout() => {
                Error::Transcription(format!("request timed out after {:?}", self.timeout))
            }
            Error::Transcription(_) => e,
            other => Error::Transcription(other.to_string()),
        })?;

        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(Error::Transcription("empty transcript".to_string()));
        }

        tracing::info!(provider = ?self.provider, transcript = %text, "transcription complete");
        Ok(text)
    }
}

fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("mp3") => "audio/mpeg",
        _ => "audio/wav",
    }
}

/// Transcriber that returns fixed text, for dry runs
#[derive(Debug, Clone)]
pub struct StaticTranscriber {
    text: String,
}

impl StaticTranscriber {
    /// Create a transcriber that always yields `text`
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[async_trait]
impl Transcriber for StaticTranscriber {
    async fn transcribe(&self, path: &Path) -> Result<String> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(Error::Transcription(format!(
                "artifact {} does not exist",
                path.display()
            )));
        }
        if self.text.trim().is_empty() {
            return Err(Error::Transcription("empty transcript".to_string()));
        }
        Ok(self.text.clone())
    }
}
