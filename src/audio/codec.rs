//! PCM16 little-endian conversion and sample-rate conversion

use rubato::{FftFixedIn, Resampler};

use crate::error::PlaybackError;

/// Scale applied when encoding a float sample to PCM16
const ENCODE_SCALE: f32 = 32767.0;

/// Divisor applied when decoding a PCM16 sample to float
const DECODE_SCALE: f32 = 32768.0;

/// Input block size of the FFT resampler
const RESAMPLE_CHUNK: usize = 1024;

/// Encode float samples in [-1, 1] as PCM16 little-endian bytes
///
/// Samples outside the range are clamped before scaling, so the result never
/// overflows the i16 domain.
#[must_use]
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        out.extend_from_slice(&encode_sample(sample).to_le_bytes());
    }
    out
}

/// Encode a single float sample
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn encode_sample(sample: f32) -> i16 {
    // NaN maps to silence
    let clamped = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    (clamped * ENCODE_SCALE).round() as i16
}

/// Decode PCM16 little-endian bytes to float samples
///
/// # Errors
///
/// Returns `DecodeFailed` if the buffer is empty or has an odd byte length
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>, PlaybackError> {
    if bytes.is_empty() {
        return Err(PlaybackError::DecodeFailed("empty audio frame".to_string()));
    }
    if bytes.len() % 2 != 0 {
        return Err(PlaybackError::DecodeFailed(format!(
            "frame length {} is not a whole number of PCM16 samples",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| decode_sample(i16::from_le_bytes([pair[0], pair[1]])))
        .collect())
}

/// Decode a single PCM16 sample
#[must_use]
pub fn decode_sample(sample: i16) -> f32 {
    f32::from(sample) / DECODE_SCALE
}

/// Average interleaved channels down to mono
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Streaming mono sample-rate converter
///
/// Keeps resampler state across calls so consecutive frames of one utterance
/// join without discontinuities. Input that does not fill a whole block waits
/// for the next call or for [`RateConverter::flush`].
///
/// The resampler's group delay is removed: output sample `n` lines up with
/// input time `n / to_rate`, and a flushed utterance yields exactly
/// `ceil(len * to_rate / from_rate)` samples.
pub struct RateConverter {
    from_rate: u32,
    to_rate: u32,
    resampler: FftFixedIn<f64>,
    pending: Vec<f64>,
    /// Leading delay samples still to discard
    skip: usize,
    consumed: u64,
    emitted: u64,
}

impl std::fmt::Debug for RateConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateConverter")
            .field("from_rate", &self.from_rate)
            .field("to_rate", &self.to_rate)
            .field("pending", &self.pending.len())
            .field("consumed", &self.consumed)
            .finish_non_exhaustive()
    }
}

impl RateConverter {
    /// Create a converter between two sample rates
    ///
    /// # Errors
    ///
    /// Returns `DecodeFailed` if the resampler rejects the rate pair
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self, PlaybackError> {
        let resampler =
            FftFixedIn::<f64>::new(from_rate as usize, to_rate as usize, RESAMPLE_CHUNK, 2, 1)
                .map_err(|e| PlaybackError::DecodeFailed(format!("resampler init failed: {e}")))?;
        let skip = resampler.output_delay();

        Ok(Self {
            from_rate,
            to_rate,
            resampler,
            pending: Vec::new(),
            skip,
            consumed: 0,
            emitted: 0,
        })
    }

    /// Input sample rate
    #[must_use]
    pub const fn from_rate(&self) -> u32 {
        self.from_rate
    }

    /// Output sample rate
    #[must_use]
    pub const fn to_rate(&self) -> u32 {
        self.to_rate
    }

    /// Feed samples and return every converted sample that is ready
    ///
    /// # Errors
    ///
    /// Returns `DecodeFailed` if the resampler fails
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>, PlaybackError> {
        self.pending.extend(samples.iter().map(|&s| f64::from(s)));
        self.consumed += samples.len() as u64;

        let mut output = Vec::new();
        loop {
            let needed = self.resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let block: Vec<f64> = self.pending.drain(..needed).collect();
            self.run_block(block, &mut output)?;
        }
        Ok(output)
    }

    /// End the utterance: emit everything still held back, then reset
    ///
    /// Buffered input and the delayed tail are pushed out with silence and
    /// the result is cut at the utterance's converted length. The converter
    /// is ready for a new utterance afterwards.
    ///
    /// # Errors
    ///
    /// Returns `DecodeFailed` if the resampler fails
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn flush(&mut self) -> Result<Vec<f32>, PlaybackError> {
        if self.consumed == 0 {
            return Ok(Vec::new());
        }

        let expected = ((self.consumed as f64) * f64::from(self.to_rate)
            / f64::from(self.from_rate))
        .ceil() as u64;

        let mut output = Vec::new();
        while self.emitted < expected {
            let needed = self.resampler.input_frames_next();
            let mut block = std::mem::take(&mut self.pending);
            block.resize(needed, 0.0);
            self.run_block(block, &mut output)?;
        }

        let excess = (self.emitted - expected) as usize;
        output.truncate(output.len().saturating_sub(excess));

        self.reset();
        Ok(output)
    }

    fn reset(&mut self) {
        self.resampler.reset();
        self.pending.clear();
        self.skip = self.resampler.output_delay();
        self.consumed = 0;
        self.emitted = 0;
    }

    #[allow(clippy::cast_possible_truncation)]
    fn run_block(&mut self, block: Vec<f64>, output: &mut Vec<f32>) -> Result<(), PlaybackError> {
        let result = self
            .resampler
            .process(&[block], None)
            .map_err(|e| PlaybackError::DecodeFailed(format!("resample failed: {e}")))?;
        if let Some(channel) = result.first() {
            let skipped = self.skip.min(channel.len());
            self.skip -= skipped;
            output.extend(channel[skipped..].iter().map(|&s| s as f32));
            self.emitted += (channel.len() - skipped) as u64;
        }
        Ok(())
    }
}
