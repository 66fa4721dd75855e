//! Sample-rate conversion with rubato's polynomial resamplers.
//!
//! Devices run at their native rate (commonly 44.1 or 48 kHz) while the live
//! session speaks 16 kHz in and 24 kHz out. `RateConverter` brings captured
//! audio down to 16 kHz on the pump thread. `PullResampler` runs inside the
//! output callback and turns the 24 kHz playback timeline into device frames.
//!
//! When the two rates match, no rubato session is created at all.

use rubato::{FastFixedIn, FastFixedOut, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{Result, VoiceError};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` in passthrough mode.
    resampler: Option<FastFixedIn<f32>>,
    /// Partial input carried over between calls.
    input_buf: Vec<f32>,
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// Create a converter from `from_rate` to `to_rate` working in
    /// `chunk_size`-frame steps.
    ///
    /// # Errors
    /// Returns `VoiceError::AudioStream` if rubato fails to initialise.
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        if from_rate == 0 || to_rate == 0 {
            return Err(VoiceError::AudioStream(format!(
                "invalid resample rates {from_rate} -> {to_rate}"
            )));
        }
        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
            });
        }

        let ratio = to_rate as f64 / from_rate as f64;
        let resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk_size, 1)
            .map_err(|e| VoiceError::AudioStream(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        tracing::debug!(from_rate, to_rate, chunk_size, max_out, "resampler created");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::new(),
            chunk_size,
            output_buf: vec![vec![0f32; max_out]; 1],
        })
    }

    /// Process incoming samples, returning converted output (may be empty).
    ///
    /// Samples are accumulated until a full `chunk_size` step is available;
    /// the remainder is kept for the next call.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);
        let mut result = Vec::new();
        let mut consumed = 0;

        while self.input_buf.len() - consumed >= self.chunk_size {
            let input_slice = &self.input_buf[consumed..consumed + self.chunk_size];
            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_, produced)) => result.extend_from_slice(&self.output_buf[0][..produced]),
                Err(e) => error!("resampler process error: {e}"),
            }
            consumed += self.chunk_size;
        }
        self.input_buf.drain(..consumed);

        result
    }

    /// Returns `true` when no resampling occurs.
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

/// Output frames per rubato call on the render thread.
pub const RENDER_CHUNK: usize = 64;

/// Fixed-output converter for a render callback.
///
/// One instance lives for the whole output stream and is fed the timeline in
/// order, so interpolation history carries across scheduled buffers. Source
/// frames are pulled on demand; every buffer is allocated up front.
pub struct PullResampler {
    resampler: FastFixedOut<f32>,
    input: Vec<f32>,
    output: Vec<Vec<f32>>,
    /// Next unread frame in `output[0]`.
    read: usize,
}

impl PullResampler {
    /// # Errors
    /// Returns `VoiceError::AudioStream` for zero or equal rates, or if rubato
    /// fails to initialise.
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        if from_rate == 0 || to_rate == 0 || from_rate == to_rate {
            return Err(VoiceError::AudioStream(format!(
                "invalid render resample rates {from_rate} -> {to_rate}"
            )));
        }
        let ratio = to_rate as f64 / from_rate as f64;
        let resampler =
            FastFixedOut::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, RENDER_CHUNK, 1)
                .map_err(|e| VoiceError::AudioStream(format!("render resampler init: {e}")))?;
        let input = vec![0f32; resampler.input_frames_max()];
        tracing::debug!(from_rate, to_rate, "render resampler created");

        Ok(Self {
            resampler,
            input,
            output: vec![vec![0f32; RENDER_CHUNK]; 1],
            read: RENDER_CHUNK,
        })
    }

    /// Fill `out` with converted frames. `source` is handed a slice to fill
    /// with the next frames of the timeline whenever rubato needs input.
    pub fn fill(&mut self, out: &mut [f32], mut source: impl FnMut(&mut [f32])) {
        let mut written = 0;
        while written < out.len() {
            if self.read == RENDER_CHUNK {
                let needed = self.resampler.input_frames_next().min(self.input.len());
                source(&mut self.input[..needed]);
                if let Err(e) = self.resampler.process_into_buffer(
                    &[&self.input[..needed]],
                    &mut self.output,
                    None,
                ) {
                    error!("render resampler error: {e}");
                    out[written..].fill(0.0);
                    return;
                }
                self.read = 0;
            }
            let n = (RENDER_CHUNK - self.read).min(out.len() - written);
            out[written..written + n].copy_from_slice(&self.output[0][self.read..self.read + n]);
            self.read += n;
            written += n;
        }
    }
}
