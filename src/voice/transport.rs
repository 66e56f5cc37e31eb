//! Voice transport boundary
//!
//! The group-call layer (join, per-speaker audio taps, speaking events) sits
//! behind [`VoiceTransport`] so sessions can run over a real voice gateway or
//! the in-process [`super::LoopbackTransport`].

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Result;

/// Encoded audio chunks for one speaker, in arrival order.
///
/// The stream ends when the sender side is dropped.
pub type RawAudioStream = mpsc::Receiver<Vec<u8>>;

/// Capacity of per-speaker audio taps
pub const AUDIO_TAP_CAPACITY: usize = 256;

/// Capacity of the speaking event stream
pub const EVENT_CAPACITY: usize = 64;

/// A voice channel inside a guild/group
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelRef {
    /// Guild/group identifier
    pub guild_id: String,

    /// Voice channel identifier
    pub channel_id: String,
}

impl ChannelRef {
    /// Create a channel reference
    #[must_use]
    pub fn new(guild_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            guild_id: guild_id.into(),
            channel_id: channel_id.into(),
        }
    }
}

impl std::fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.guild_id, self.channel_id)
    }
}

/// Speaking state change for one user in a joined channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeakingEvent {
    /// Speaker started transmitting audio
    Started(String),
    /// Speaker stopped transmitting audio
    Ended(String),
}

/// Opaque handle for a joined channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    /// Transport-assigned connection id
    pub id: u64,

    /// Channel this connection is joined to
    pub channel: ChannelRef,
}

/// A freshly joined channel: its handle plus speaking events
#[derive(Debug)]
pub struct TransportConnection {
    /// Handle used for subscriptions and disconnect
    pub handle: ConnectionHandle,

    /// Speaking start/end events for every user in the channel
    pub events: mpsc::Receiver<SpeakingEvent>,
}

/// Group voice call layer consumed by sessions
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Transport name for logging
    fn name(&self) -> &'static str;

    /// Join a voice channel
    ///
    /// # Errors
    ///
    /// Returns `Error::Connect` if the channel cannot be joined
    async fn join(&self, channel: &ChannelRef) -> Result<TransportConnection>;

    /// Open a new tap on one speaker's encoded audio.
    ///
    /// Several taps on the same speaker may be open at once; each receives
    /// every chunk.
    ///
    /// # Errors
    ///
    /// Returns error if the connection is gone
    fn subscribe(&self, connection: &ConnectionHandle, speaker: &str) -> Result<RawAudioStream>;

    /// Leave the channel and close every tap opened through `connection`
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails to leave cleanly
    async fn disconnect(&self, connection: ConnectionHandle) -> Result<()>;
}
