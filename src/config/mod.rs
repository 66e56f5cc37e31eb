//! Configuration management for the listener

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::{Error, Result};
use file::ListenConfigFile;

/// Default transport join timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default follow-up recording window in seconds
pub const DEFAULT_RECORD_SECS: u64 = 10;

/// Shortest allowed recording window in seconds
pub const MIN_RECORD_SECS: u64 = 3;

/// Longest allowed recording window in seconds
pub const MAX_RECORD_SECS: u64 = 30;

/// Default keyword sensitivity
pub const DEFAULT_SENSITIVITY: f32 = 0.5;

/// Listener configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Voice session configuration
    pub voice: VoiceConfig,

    /// Keyword engine configuration
    pub keyword: KeywordConfig,

    /// Speech-to-text configuration
    pub stt: SttConfig,
}

/// Voice session and recording configuration
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Bound on the transport join
    pub connect_timeout: Duration,

    /// Length of the follow-up recording window (3..=30s)
    pub record_duration: Duration,

    /// Extra time a recording may spend converting after its window
    pub grace: Duration,

    /// Window during which repeat detections from one speaker are ignored
    pub refractory: Duration,

    /// Directory for raw sinks and converted artifacts
    pub scratch_dir: PathBuf,

    /// Artifact container
    pub container: Container,

    /// ffmpeg binary used for the mp3 container
    pub ffmpeg_path: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            record_duration: Duration::from_secs(DEFAULT_RECORD_SECS),
            grace: Duration::from_millis(1500),
            refractory: Duration::from_millis(1500),
            scratch_dir: default_scratch_dir(),
            container: Container::Wav,
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

/// Playable container the raw sink is converted into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Container {
    /// RIFF/WAVE, written in-process
    #[default]
    Wav,
    /// MPEG layer 3, via ffmpeg
    Mp3,
}

impl Container {
    /// Parse from a config string
    ///
    /// # Errors
    ///
    /// Returns error for unknown containers
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "wav" => Ok(Self::Wav),
            "mp3" => Ok(Self::Mp3),
            other => Err(Error::Config(format!("unknown container: {other}"))),
        }
    }

    /// File extension for artifacts
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
        }
    }
}

/// Keyword engine configuration
#[derive(Debug, Clone)]
pub struct KeywordConfig {
    /// Engine access key
    pub access_key: Option<SecretString>,

    /// Keyword model asset
    pub asset_path: Option<PathBuf>,

    /// Detection sensitivity in `0.0..=1.0`
    pub sensitivity: f32,
}

impl Default for KeywordConfig {
    fn default() -> Self {
        Self {
            access_key: None,
            asset_path: None,
            sensitivity: DEFAULT_SENSITIVITY,
        }
    }
}

/// STT provider selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SttProviderKind {
    /// `OpenAI` Whisper
    #[default]
    Whisper,
    /// Deepgram
    Deepgram,
}

/// Speech-to-text configuration
#[derive(Debug, Clone)]
pub struct SttConfig {
    /// Provider backend
    pub provider: SttProviderKind,

    /// Model identifier
    pub model: String,

    /// Bound on one transcription request
    pub timeout: Duration,

    /// `OpenAI` API key
    pub openai_key: Option<SecretString>,

    /// Deepgram API key
    pub deepgram_key: Option<SecretString>,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            provider: SttProviderKind::Whisper,
            model: "whisper-1".to_string(),
            timeout: Duration::from_secs(30),
            openai_key: None,
            deepgram_key: None,
        }
    }
}

/// Default scratch directory: `~/.cache/omni/beacon-listen/recordings`
fn default_scratch_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".cache/omni/beacon-listen/recordings"),
        |d| {
            d.cache_dir()
                .join("omni")
                .join("beacon-listen")
                .join("recordings")
        },
    )
}

/// Clamp a recording window into the supported range
#[must_use]
pub fn clamp_record_secs(secs: u64) -> Duration {
    let clamped = secs.clamp(MIN_RECORD_SECS, MAX_RECORD_SECS);
    if clamped != secs {
        tracing::warn!(requested = secs, clamped, "recording window out of range");
    }
    Duration::from_secs(clamped)
}

impl Config {
    /// Load configuration from the environment and the standard config file
    ///
    /// # Errors
    ///
    /// Returns error if a configured value is invalid
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Resolve configuration with precedence env > toml > default
    ///
    /// # Errors
    ///
    /// Returns error if a configured value is invalid
    pub fn from_sources<F>(fc: ListenConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = VoiceConfig::default();

        let record_secs = env("BEACON_LISTEN_RECORD_SECS")
            .and_then(|s| s.parse().ok())
            .or(fc.voice.record_secs)
            .unwrap_or(DEFAULT_RECORD_SECS);

        let container = env("BEACON_LISTEN_CONTAINER")
            .or(fc.voice.container)
            .map(|s| Container::parse(&s))
            .transpose()?
            .unwrap_or_default();

        let voice = VoiceConfig {
            connect_timeout: fc
                .voice
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            record_duration: clamp_record_secs(record_secs),
            grace: fc.voice.grace_ms.map_or(defaults.grace, Duration::from_millis),
            refractory: fc
                .voice
                .refractory_ms
                .map_or(defaults.refractory, Duration::from_millis),
            scratch_dir: env("BEACON_LISTEN_SCRATCH_DIR")
                .or(fc.voice.scratch_dir)
                .map_or(defaults.scratch_dir, PathBuf::from),
            container,
            ffmpeg_path: fc.voice.ffmpeg_path.unwrap_or(defaults.ffmpeg_path),
        };

        let keyword = KeywordConfig {
            access_key: env("PICOVOICE_ACCESS_KEY")
                .or(fc.keyword.access_key)
                .map(SecretString::from),
            asset_path: fc.keyword.asset_path.map(PathBuf::from),
            sensitivity: fc
                .keyword
                .sensitivity
                .unwrap_or(DEFAULT_SENSITIVITY)
                .clamp(0.0, 1.0),
        };

        let provider = match fc.stt.provider.as_deref().map(str::to_lowercase).as_deref() {
            None | Some("whisper") => SttProviderKind::Whisper,
            Some("deepgram") => SttProviderKind::Deepgram,
            Some(other) => {
                return Err(Error::Config(format!("unknown stt provider: {other}")));
            }
        };

        let stt_defaults = SttConfig::default();
        let stt = SttConfig {
            provider,
            model: env("BEACON_LISTEN_STT_MODEL")
                .or(fc.stt.model)
                .unwrap_or(stt_defaults.model),
            timeout: fc
                .stt
                .timeout_secs
                .map_or(stt_defaults.timeout, Duration::from_secs),
            openai_key: env("OPENAI_API_KEY")
                .or(fc.api_keys.openai)
                .map(SecretString::from),
            deepgram_key: env("DEEPGRAM_API_KEY")
                .or(fc.api_keys.deepgram)
                .map(SecretString::from),
        };

        Ok(Self {
            voice,
            keyword,
            stt,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_sources(ListenConfigFile::default(), env_of(&[])).unwrap();

        assert_eq!(config.voice.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.voice.record_duration, Duration::from_secs(10));
        assert_eq!(config.voice.container, Container::Wav);
        assert_eq!(config.stt.provider, SttProviderKind::Whisper);
        assert_eq!(config.stt.model, "whisper-1");
        assert!(config.keyword.access_key.is_none());
    }

    #[test]
    fn test_env_overrides_file() {
        let fc = ListenConfigFile::from_toml(
            r#"
            [voice]
            record_secs = 5
            [stt]
            model = "from-file"
            "#,
        )
        .unwrap();

        let config = Config::from_sources(
            fc,
            env_of(&[
                ("BEACON_LISTEN_RECORD_SECS", "20"),
                ("BEACON_LISTEN_STT_MODEL", "from-env"),
                ("OPENAI_API_KEY", "sk-test"),
            ]),
        )
        .unwrap();

        assert_eq!(config.voice.record_duration, Duration::from_secs(20));
        assert_eq!(config.stt.model, "from-env");
        assert_eq!(
            config.stt.openai_key.as_ref().map(|k| k.expose_secret()),
            Some("sk-test")
        );
    }

    #[test]
    fn test_record_window_is_clamped() {
        assert_eq!(clamp_record_secs(1), Duration::from_secs(3));
        assert_eq!(clamp_record_secs(120), Duration::from_secs(30));
        assert_eq!(clamp_record_secs(7), Duration::from_secs(7));
    }

    #[test]
    fn test_unknown_container_rejected() {
        let err = Config::from_sources(
            ListenConfigFile::default(),
            env_of(&[("BEACON_LISTEN_CONTAINER", "flac")]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_sensitivity_clamped() {
        let fc = ListenConfigFile::from_toml("[keyword]\nsensitivity = 3.0").unwrap();
        let config = Config::from_sources(fc, env_of(&[])).unwrap();
        assert!((config.keyword.sensitivity - 1.0).abs() < f32::EPSILON);
    }
}
