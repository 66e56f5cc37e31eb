//! Energy-gated wake phrase engine
//!
//! A keyword engine that needs no native library: it reports a match when a
//! short burst of speech is followed by silence. Useful for local runs and
//! as the default when no vendor engine is wired in.

use std::path::Path;

use secrecy::SecretString;

use super::keyword::{KeywordEngine, KeywordEngineFactory, KeywordIndex};
use crate::Result;

/// Samples per frame (32ms at 16kHz)
pub const FRAME_LENGTH: usize = 512;

/// Engine sample rate
pub const SAMPLE_RATE: u32 = 16_000;

/// RMS energy threshold at the default sensitivity
const ENERGY_THRESHOLD: f32 = 0.03;

/// Minimum duration of speech to trigger (in samples at 16kHz)
const MIN_SPEECH_SAMPLES: usize = 4800; // 0.3 seconds

/// Longest burst still treated as a wake phrase
const MAX_SPEECH_SAMPLES: usize = 32_000; // 2 seconds

/// Silence duration to consider end of phrase (in samples)
const SILENCE_SAMPLES: usize = 8000; // 0.5 seconds

/// State of the energy engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// Waiting for speech
    Idle,
    /// Accumulating a candidate phrase
    Listening,
    /// Burst ran too long; waiting for silence before re-arming
    Overrun,
}

/// Energy-gated keyword engine
pub struct EnergyKeywordEngine {
    threshold: f32,
    state: DetectorState,
    speech_samples: usize,
    silence_samples: usize,
}

impl EnergyKeywordEngine {
    /// Create an engine; higher sensitivity lowers the energy threshold
    #[must_use]
    pub fn new(sensitivity: f32) -> Self {
        let threshold = ENERGY_THRESHOLD * (1.5 - sensitivity.clamp(0.0, 1.0));
        tracing::debug!(threshold, "energy keyword engine initialized");

        Self {
            threshold,
            state: DetectorState::Idle,
            speech_samples: 0,
            silence_samples: 0,
        }
    }

    /// Get current state
    #[must_use]
    pub const fn state(&self) -> DetectorState {
        self.state
    }

    /// Reset to idle
    pub const fn reset(&mut self) {
        self.state = DetectorState::Idle;
        self.speech_samples = 0;
        self.silence_samples = 0;
    }
}

impl KeywordEngine for EnergyKeywordEngine {
    fn frame_length(&self) -> usize {
        FRAME_LENGTH
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn process(&mut self, frame: &[i16]) -> Result<Option<KeywordIndex>> {
        let energy = calculate_energy(frame);
        let is_speech = energy > self.threshold;

        match self.state {
            DetectorState::Idle => {
                if is_speech {
                    self.state = DetectorState::Listening;
                    self.speech_samples = frame.len();
                    self.silence_samples = 0;
                    tracing::trace!(energy, "speech detected, listening");
                }
            }
            DetectorState::Listening => {
                if is_speech {
                    self.speech_samples += frame.len();
                    self.silence_samples = 0;
                } else {
                    self.silence_samples += frame.len();
                }

                if self.speech_samples > MAX_SPEECH_SAMPLES {
                    tracing::trace!("burst too long for a wake phrase");
                    self.state = DetectorState::Overrun;
                    self.silence_samples = 0;
                } else if self.silence_samples > SILENCE_SAMPLES {
                    let matched = self.speech_samples >= MIN_SPEECH_SAMPLES;
                    tracing::trace!(speech = self.speech_samples, matched, "phrase complete");
                    self.reset();
                    if matched {
                        return Ok(Some(0));
                    }
                }
            }
            DetectorState::Overrun => {
                if is_speech {
                    self.silence_samples = 0;
                } else {
                    self.silence_samples += frame.len();
                    if self.silence_samples > SILENCE_SAMPLES {
                        self.reset();
                    }
                }
            }
        }

        Ok(None)
    }
}

/// Factory for [`EnergyKeywordEngine`]
///
/// The credential and asset are accepted for interface parity and ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnergyEngineFactory;

impl KeywordEngineFactory for EnergyEngineFactory {
    fn create(
        &self,
        _credential: &SecretString,
        keyword_asset: Option<&Path>,
        sensitivity: f32,
    ) -> Result<Box<dyn KeywordEngine>> {
        if let Some(asset) = keyword_asset {
            tracing::debug!(asset = %asset.display(), "energy engine ignores keyword asset");
        }
        Ok(Box::new(EnergyKeywordEngine::new(sensitivity)))
    }
}

/// Calculate RMS energy of 16-bit samples, normalized to `0.0..=1.0`
#[allow(clippy::cast_precision_loss)]
fn calculate_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples
        .iter()
        .map(|&s| {
            let v = f32::from(s) / 32768.0;
            v * v
        })
        .sum();
    (sum_squares / samples.len() as f32).sqrt()
}
