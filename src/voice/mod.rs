//! Voice processing module
//!
//! Handles the audio side of a listening session: transport taps, decoding,
//! wake word detection, follow-up recording and transcription.

pub mod decoder;
pub mod keyword;
pub mod loopback;
pub mod recording;
pub mod scratch;
pub mod stt;
pub mod subscription;
pub mod transcode;
pub mod transport;
mod wake_word;

pub use decoder::{Codec, Decoder, PcmCodec, samples_to_bytes};
pub use keyword::{KeywordEngine, KeywordEngineFactory, KeywordIndex, KeywordSettings, KeywordSpotter};
pub use loopback::{JoinBehavior, LoopbackTransport};
pub use recording::{JobStatus, RECORDING_SAMPLE_RATE, RecordingJob, RecordingSession};
pub use stt::{SpeechToText, StaticTranscriber, Transcriber};
pub use subscription::{AudioSubscriptionManager, ClosedSubscription, CloseReason, WakeEvent};
pub use transcode::{FfmpegTranscoder, Transcoder, WavTranscoder};
pub use transport::{ChannelRef, ConnectionHandle, RawAudioStream, SpeakingEvent, TransportConnection, VoiceTransport};
pub use wake_word::{DetectorState, EnergyEngineFactory, EnergyKeywordEngine};
