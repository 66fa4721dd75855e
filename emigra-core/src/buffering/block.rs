//! Typed audio blocks passed between capture, codec and playback.

/// Session capture rate expected by the remote model (Hz).
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Rate of the synthesized speech returned by the remote model (Hz).
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// A contiguous block of mono PCM samples at a known sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (16000 for capture, 24000 for playback).
    pub sample_rate: u32,
}

impl AudioBlock {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Returns the duration of this block in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if the block contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// 16-bit little-endian PCM bytes derived from an [`AudioBlock`].
///
/// Always `2 × sample count` bytes long.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncodedFrame {
    bytes: Vec<u8>,
}

impl EncodedFrame {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
