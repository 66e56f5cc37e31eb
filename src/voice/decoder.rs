//! Transport audio decoding
//!
//! A [`Codec`] hands out one [`Decoder`] per audio tap. Decoders turn the
//! transport's encoded chunks into mono 16-bit PCM frames at the rate the
//! keyword engine or recording sink expects.

use rubato::{FftFixedIn, Resampler};

use crate::{Error, Result};

/// Input samples handed to the resampler per call
const RESAMPLE_CHUNK: usize = 1024;

/// Sub-chunks per resampler call
const RESAMPLE_SUB_CHUNKS: usize = 2;

/// Decoder factory for one transport encoding
pub trait Codec: Send + Sync {
    /// Open a decoder producing `channels`-channel PCM at `sample_rate`.
    ///
    /// When the transport rate differs from `sample_rate`, the decoder
    /// re-frames its output into blocks of exactly `frame_size` samples.
    /// At equal rates each transport chunk comes out as one frame of
    /// whatever size the transport sent.
    ///
    /// # Errors
    ///
    /// Returns error if the codec cannot produce the requested format
    fn decoder(&self, sample_rate: u32, channels: u16, frame_size: usize)
    -> Result<Box<dyn Decoder>>;
}

/// Stateful per-tap decoder
pub trait Decoder: Send {
    /// Decode one transport chunk into zero or more PCM frames
    ///
    /// # Errors
    ///
    /// Returns `Error::Decode` for malformed input
    fn push(&mut self, raw: &[u8]) -> Result<Vec<Vec<i16>>>;
}

/// Codec for transports that already carry little-endian s16 PCM
///
/// Interleaved stereo is downmixed and any input rate is resampled with an
/// FFT resampler.
#[derive(Debug, Clone, Copy)]
pub struct PcmCodec {
    input_rate: u32,
    input_channels: u16,
}

impl PcmCodec {
    /// Create a codec for the transport's PCM format
    #[must_use]
    pub const fn new(input_rate: u32, input_channels: u16) -> Self {
        Self {
            input_rate,
            input_channels,
        }
    }
}

impl Codec for PcmCodec {
    fn decoder(
        &self,
        sample_rate: u32,
        channels: u16,
        frame_size: usize,
    ) -> Result<Box<dyn Decoder>> {
        if channels != 1 {
            return Err(Error::Config(format!(
                "pcm codec only produces mono, requested {channels} channels"
            )));
        }
        if !matches!(self.input_channels, 1 | 2) {
            return Err(Error::Config(format!(
                "unsupported transport channel count: {}",
                self.input_channels
            )));
        }
        if sample_rate == 0 || self.input_rate == 0 {
            return Err(Error::Config(format!(
                "cannot resample {}Hz to {sample_rate}Hz",
                self.input_rate
            )));
        }

        let resampler = if self.input_rate == sample_rate {
            None
        } else {
            Some(Resampling::new(self.input_rate, sample_rate, frame_size)?)
        };

        tracing::trace!(
            input_rate = self.input_rate,
            input_channels = self.input_channels,
            sample_rate,
            frame_size,
            resampling = resampler.is_some(),
            "pcm decoder opened"
        );

        Ok(Box::new(PcmDecoder {
            input_channels: usize::from(self.input_channels),
            resampler,
        }))
    }
}

struct PcmDecoder {
    input_channels: usize,
    resampler: Option<Resampling>,
}

impl Decoder for PcmDecoder {
    #[allow(clippy::cast_possible_truncation)]
    fn push(&mut self, raw: &[u8]) -> Result<Vec<Vec<i16>>> {
        let frame_bytes = 2 * self.input_channels;
        if raw.len() % frame_bytes != 0 {
            return Err(Error::Decode(format!(
                "chunk of {} bytes is not a whole number of {frame_bytes}-byte frames",
                raw.len()
            )));
        }

        let interleaved = raw
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]));

        let mono: Vec<i16> = if self.input_channels == 2 {
            let samples: Vec<i16> = interleaved.collect();
            samples
                .chunks_exact(2)
                .map(|lr| ((i32::from(lr[0]) + i32::from(lr[1])) / 2) as i16)
                .collect()
        } else {
            interleaved.collect()
        };

        match self.resampler.as_mut() {
            Some(resampler) => resampler.push(&mono),
            None if mono.is_empty() => Ok(Vec::new()),
            None => Ok(vec![mono]),
        }
    }
}

/// Rate conversion with carry buffers on both sides.
///
/// Input is held until a full resampler chunk is available; output is held
/// until a full frame is available.
struct Resampling {
    resampler: FftFixedIn<f32>,
    pending_in: Vec<f32>,
    pending_out: Vec<i16>,
    frame_size: usize,
}

impl Resampling {
    fn new(input_rate: u32, output_rate: u32, frame_size: usize) -> Result<Self> {
        let resampler = FftFixedIn::<f32>::new(
            input_rate as usize,
            output_rate as usize,
            RESAMPLE_CHUNK,
            RESAMPLE_SUB_CHUNKS,
            1,
        )
        .map_err(|e| Error::Config(format!("resampler init failed: {e}")))?;

        Ok(Self {
            resampler,
            pending_in: Vec::with_capacity(RESAMPLE_CHUNK * 2),
            pending_out: Vec::new(),
            frame_size,
        })
    }

    fn push(&mut self, samples: &[i16]) -> Result<Vec<Vec<i16>>> {
        self.pending_in
            .extend(samples.iter().map(|&s| f32::from(s) / 32768.0));

        loop {
            let needed = self.resampler.input_frames_next();
            if self.pending_in.len() < needed {
                break;
            }

            let out = self
                .resampler
                .process(&[&self.pending_in[..needed]], None)
                .map_err(|e| Error::Decode(format!("resample failed: {e}")))?;
            self.pending_in.drain(..needed);

            if let Some(channel) = out.first() {
                self.pending_out.extend(channel.iter().map(|&s| to_i16(s)));
            }
        }

        if self.frame_size == 0 {
            return Ok(if self.pending_out.is_empty() {
                Vec::new()
            } else {
                vec![std::mem::take(&mut self.pending_out)]
            });
        }

        let whole = self.pending_out.len() / self.frame_size * self.frame_size;
        let frames = self
            .pending_out
            .drain(..whole)
            .collect::<Vec<i16>>()
            .chunks_exact(self.frame_size)
            .map(<[i16]>::to_vec)
            .collect();
        Ok(frames)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_i16(sample: f32) -> i16 {
    (sample * 32768.0).round().clamp(-32768.0, 32767.0) as i16
}

/// Encode mono samples as little-endian s16 bytes
#[must_use]
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}
