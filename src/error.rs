//! Error types for the voice command pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice command pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Voice transport join failed or timed out
    #[error("connect error: {0}")]
    Connect(String),

    /// A session is already active (or starting) for the channel
    #[error("already listening in channel {0}")]
    AlreadyListening(String),

    /// No active session for the channel
    #[error("not listening in channel {0}")]
    NotListening(String),

    /// Malformed transport audio for one speaker
    #[error("decode error: {0}")]
    Decode(String),

    /// Keyword engine could not be created or rejected a frame
    #[error("keyword engine error: {0}")]
    KeywordEngine(String),

    /// A recording window closed without any decoded audio
    #[error("no audio detected from {0}")]
    NoAudioDetected(String),

    /// A recording is already in flight for this session
    #[error("recording already in progress for {0}")]
    RecordingInProgress(String),

    /// Raw sink could not be converted into a container artifact
    #[error("conversion error: {0}")]
    Conversion(String),

    /// Speech-to-text provider failure
    #[error("transcription error: {0}")]
    Transcription(String),

    /// Command handler failure
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// The owning session stopped while the stage was pending
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WAV encoding error
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
}

impl Error {
    /// Whether this error only concerns a session's lifecycle
    /// (as opposed to one wake-word episode)
    #[must_use]
    pub const fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::AlreadyListening(_) | Self::NotListening(_)
        )
    }
}
