//! Listening sessions
//!
//! A session is one joined voice channel: its keyword subscriptions, its
//! recorder and the episode in flight. Sessions run as independent actors
//! owned by the [`VoiceSessionRegistry`].

mod actor;
mod registry;
mod stats;

use serde::Serialize;

pub use registry::{RegistryBuilder, VoiceSessionRegistry, WakeCallback};
pub use stats::{SessionStats, StatsSnapshot};

/// Lifecycle of a listening session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, transport not yet joined
    Idle,
    /// Spotting wake words
    Listening,
    /// Listening, with a wake-word episode in flight
    Recording,
    /// Torn down
    Stopped,
}
