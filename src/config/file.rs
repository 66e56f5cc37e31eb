//! TOML configuration file loading
//!
//! Supports `~/.config/omni/beacon-listen/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ListenConfigFile {
    /// Voice session / recording configuration
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// Keyword engine configuration
    #[serde(default)]
    pub keyword: KeywordFileConfig,

    /// Speech-to-text configuration
    #[serde(default)]
    pub stt: SttFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Voice session configuration
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// Seconds to wait for the transport join
    pub connect_timeout_secs: Option<u64>,

    /// Seconds recorded after a wake word
    pub record_secs: Option<u64>,

    /// Extra milliseconds a recording may take to convert after its window
    pub grace_ms: Option<u64>,

    /// Milliseconds during which repeat detections from one speaker are ignored
    pub refractory_ms: Option<u64>,

    /// Directory for raw sinks and converted artifacts
    pub scratch_dir: Option<String>,

    /// Artifact container ("wav" or "mp3")
    pub container: Option<String>,

    /// Path to the ffmpeg binary (mp3 container only)
    pub ffmpeg_path: Option<String>,
}

/// Keyword engine configuration
#[derive(Debug, Default, Deserialize)]
pub struct KeywordFileConfig {
    /// Engine access key
    pub access_key: Option<String>,

    /// Path to the keyword model asset
    pub asset_path: Option<String>,

    /// Detection sensitivity in `0.0..=1.0`
    pub sensitivity: Option<f32>,
}

/// Speech-to-text configuration
#[derive(Debug, Default, Deserialize)]
pub struct SttFileConfig {
    /// Provider ("whisper" or "deepgram")
    pub provider: Option<String>,

    /// Model identifier (e.g. "whisper-1")
    pub model: Option<String>,

    /// Request timeout in seconds
    pub timeout_secs: Option<u64>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub deepgram: Option<String>,
}

impl ListenConfigFile {
    /// Parse a config file body
    ///
    /// # Errors
    ///
    /// Returns error if the body is not valid TOML for this schema
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

/// Load the TOML config file from the standard path
///
/// Returns `ListenConfigFile::default()` if the file doesn't exist or can't be parsed.
#[must_use]
pub fn load_config_file() -> ListenConfigFile {
    config_file_path().map_or_else(ListenConfigFile::default, |path| load_from(&path))
}

/// Load a config file from an explicit path, falling back to defaults
#[must_use]
pub fn load_from(path: &Path) -> ListenConfigFile {
    if !path.exists() {
        return ListenConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match ListenConfigFile::from_toml(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ListenConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ListenConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/omni/beacon-listen/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("beacon-listen")
            .join("config.toml")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial_file() {
        let fc = ListenConfigFile::from_toml(
            r#"
            [voice]
            record_secs = 12
            container = "mp3"

            [keyword]
            sensitivity = 0.7
            "#,
        )
        .unwrap();

        assert_eq!(fc.voice.record_secs, Some(12));
        assert_eq!(fc.voice.container.as_deref(), Some("mp3"));
        assert_eq!(fc.keyword.sensitivity, Some(0.7));
        assert!(fc.stt.model.is_none());
    }

    #[test]
    fn test_parse_invalid_file() {
        let err = ListenConfigFile::from_toml("[voice]\nrecord_secs = \"ten\"").unwrap_err();
        assert!(matches!(err, crate::Error::Toml(_)));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let fc = load_from(Path::new("/nonexistent/beacon-listen/config.toml"));
        assert!(fc.voice.record_secs.is_none());
    }

    #[test]
    fn test_load_unparsable_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not = [valid").unwrap();

        let fc = load_from(&path);
        assert!(fc.voice.container.is_none());
    }
}
