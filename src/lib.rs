//! Beacon Listen - voice command pipeline for group voice calls
//!
//! This library joins voice channels, spots a wake word on every speaker's
//! audio, records the follow-up utterance and turns it into a dispatched
//! command:
//! - Per-channel listening sessions with per-speaker keyword engines
//! - Timer-bounded follow-up recording and container conversion
//! - Speech-to-text, intent parsing and handler dispatch
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │               VoiceSessionRegistry                   │
//! │   one session actor per channel                      │
//! └────────────────────┬────────────────────────────────┘
//!                      │ speaking events, audio taps
//! ┌────────────────────▼────────────────────────────────┐
//! │  AudioSubscriptionManager → KeywordSpotter           │
//! │  (decoder + engine per speaker)                      │
//! └────────────────────┬────────────────────────────────┘
//!                      │ wake word
//! ┌────────────────────▼────────────────────────────────┐
//! │  RecordingSession → Transcriber → parse → dispatch   │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod command;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod voice;

pub use command::{CommandDispatcher, CommandName, Intent};
pub use config::Config;
pub use error::{Error, Result};
pub use pipeline::{EpisodeOutcome, EpisodeReport, FailureKind, Stage};
pub use session::{RegistryBuilder, SessionState, VoiceSessionRegistry, WakeCallback};
