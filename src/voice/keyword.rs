//! Keyword spotting
//!
//! Native keyword engines consume fixed-length frames and keep a sliding
//! window across calls. [`KeywordSpotter`] owns one engine handle and
//! releases it when dropped.

use std::path::Path;

use secrecy::SecretString;

use crate::{Error, Result};

/// Index of the matched keyword in the engine's keyword list
pub type KeywordIndex = usize;

/// A fixed-frame keyword engine handle
///
/// Each handle must only see frames from a single audio source, in order.
pub trait KeywordEngine: Send {
    /// Exact number of samples per frame
    fn frame_length(&self) -> usize;

    /// Sample rate the engine expects
    fn sample_rate(&self) -> u32;

    /// Feed one frame; returns the matched keyword, if any
    ///
    /// # Errors
    ///
    /// Returns error if the engine fails to process the frame
    fn process(&mut self, frame: &[i16]) -> Result<Option<KeywordIndex>>;
}

/// Creates keyword engine handles
pub trait KeywordEngineFactory: Send + Sync {
    /// Create a new engine handle
    ///
    /// # Errors
    ///
    /// Returns `Error::KeywordEngine` if the engine rejects the credential
    /// or asset
    fn create(
        &self,
        credential: &SecretString,
        keyword_asset: Option<&Path>,
        sensitivity: f32,
    ) -> Result<Box<dyn KeywordEngine>>;
}

/// Keyword engine settings shared by every subscription in a session
#[derive(Debug, Clone)]
pub struct KeywordSettings {
    /// Engine access credential
    pub credential: SecretString,

    /// Keyword model asset
    pub asset: Option<std::path::PathBuf>,

    /// Detection sensitivity in `0.0..=1.0`
    pub sensitivity: f32,
}

impl KeywordSettings {
    /// Create an engine handle from these settings
    ///
    /// # Errors
    ///
    /// Returns error if the factory rejects the settings
    pub fn create(&self, factory: &dyn KeywordEngineFactory) -> Result<KeywordSpotter> {
        let engine = factory.create(&self.credential, self.asset.as_deref(), self.sensitivity)?;
        Ok(KeywordSpotter::new(engine))
    }
}

/// Owns one keyword engine handle
pub struct KeywordSpotter {
    engine: Box<dyn KeywordEngine>,
    frames: u64,
}

impl KeywordSpotter {
    /// Wrap an engine handle
    #[must_use]
    pub fn new(engine: Box<dyn KeywordEngine>) -> Self {
        Self { engine, frames: 0 }
    }

    /// Exact number of samples per frame
    #[must_use]
    pub fn frame_length(&self) -> usize {
        self.engine.frame_length()
    }

    /// Sample rate the engine expects
    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.engine.sample_rate()
    }

    /// Whether `frame` has the exact length the engine requires
    #[must_use]
    pub fn accepts(&self, frame: &[i16]) -> bool {
        frame.len() == self.engine.frame_length()
    }

    /// Number of frames handed to the engine
    #[must_use]
    pub const fn frames_processed(&self) -> u64 {
        self.frames
    }

    /// Feed one frame of exactly [`Self::frame_length`] samples
    ///
    /// # Errors
    ///
    /// Returns error if the frame has the wrong length or the engine fails
    pub fn process(&mut self, frame: &[i16]) -> Result<Option<KeywordIndex>> {
        if !self.accepts(frame) {
            return Err(Error::KeywordEngine(format!(
                "frame of {} samples, engine requires {}",
                frame.len(),
                self.frame_length()
            )));
        }

        self.frames += 1;
        self.engine.process(frame)
    }
}

impl Drop for KeywordSpotter {
    fn drop(&mut self) {
        tracing::trace!(frames = self.frames, "keyword engine released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EveryNth {
        n: u64,
        seen: u64,
    }

    impl KeywordEngine for EveryNth {
        fn frame_length(&self) -> usize {
            4
        }

        fn sample_rate(&self) -> u32 {
            16_000
        }

        fn process(&mut self, _frame: &[i16]) -> Result<Option<KeywordIndex>> {
            self.seen += 1;
            Ok((self.seen % self.n == 0).then_some(0))
        }
    }

    #[test]
    fn test_spotter_rejects_wrong_length() {
        let mut spotter = KeywordSpotter::new(Box::new(EveryNth { n: 1, seen: 0 }));

        assert!(!spotter.accepts(&[0; 3]));
        assert!(spotter.process(&[0; 3]).is_err());
        assert_eq!(spotter.frames_processed(), 0);
    }

    #[test]
    fn test_spotter_reports_matches() {
        let mut spotter = KeywordSpotter::new(Box::new(EveryNth { n: 2, seen: 0 }));

        assert_eq!(spotter.process(&[0; 4]).unwrap(), None);
        assert_eq!(spotter.process(&[0; 4]).unwrap(), Some(0));
        assert_eq!(spotter.frames_processed(), 2);
    }
}
