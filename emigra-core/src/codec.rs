//! Sample codec: float blocks ⇄ 16-bit little-endian PCM ⇄ base64 transport text.
//!
//! All functions are pure. Quantisation uses the asymmetric mapping the remote
//! session expects: encode scales by 32767, decode divides by 32768.

use base64::Engine as _;
use tracing::warn;

use crate::buffering::block::{AudioBlock, EncodedFrame};
use crate::error::Result;

/// Gain applied to the RMS level before clamping into the [0, 1] volume metric.
pub const VOLUME_GAIN: f32 = 5.0;

const ENCODE_SCALE: f32 = 32_767.0;
const DECODE_SCALE: f32 = 32_768.0;

/// Encode float samples as 16-bit little-endian PCM.
pub fn encode(block: &AudioBlock) -> EncodedFrame {
    encode_samples(&block.samples)
}

/// Encode a raw sample slice as 16-bit little-endian PCM.
pub fn encode_samples(samples: &[f32]) -> EncodedFrame {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let scaled = (sample * ENCODE_SCALE).clamp(i16::MIN as f32, i16::MAX as f32);
        bytes.extend_from_slice(&(scaled as i16).to_le_bytes());
    }
    EncodedFrame::from_bytes(bytes)
}

/// Decode 16-bit little-endian PCM into float samples tagged with `sample_rate`.
///
/// A trailing odd byte cannot form a sample and is dropped.
pub fn decode(frame: &EncodedFrame, sample_rate: u32) -> AudioBlock {
    let bytes = frame.as_bytes();
    if bytes.len() % 2 != 0 {
        warn!(len = bytes.len(), "odd-length PCM frame; dropping trailing byte");
    }
    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / DECODE_SCALE)
        .collect();
    AudioBlock::new(samples, sample_rate)
}

/// Standard base64 text form of a frame.
pub fn to_transport_text(frame: &EncodedFrame) -> String {
    base64::engine::general_purpose::STANDARD.encode(frame.as_bytes())
}

/// Parse base64 transport text back into a frame.
pub fn from_transport_text(text: &str) -> Result<EncodedFrame> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(text)?;
    Ok(EncodedFrame::from_bytes(bytes))
}

/// Root-mean-square of a sample slice. Empty input has zero energy.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Visual volume indicator in [0, 1]: RMS × [`VOLUME_GAIN`], clamped.
pub fn volume_metric(samples: &[f32]) -> f32 {
    volume_level(samples, VOLUME_GAIN)
}

/// RMS × `gain`, clamped into [0, 1].
pub fn volume_level(samples: &[f32], gain: f32) -> f32 {
    (rms(samples) * gain).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn encode_produces_two_bytes_per_sample() {
        let block = AudioBlock::new(vec![0.0; 4096], 16_000);
        assert_eq!(encode(&block).len(), 8192);
    }

    #[test]
    fn encode_clamps_out_of_range_samples() {
        let frame = encode_samples(&[2.0, -2.0, 1.0, -1.0]);
        let b = frame.as_bytes();
        assert_eq!(i16::from_le_bytes([b[0], b[1]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([b[2], b[3]]), i16::MIN);
        assert_eq!(i16::from_le_bytes([b[4], b[5]]), 32_767);
        assert_eq!(i16::from_le_bytes([b[6], b[7]]), -32_767);
    }

    #[test]
    fn encode_is_little_endian() {
        // 0.5 * 32767 = 16383.5 → truncated to 16383 = 0x3FFF
        let frame = encode_samples(&[0.5]);
        assert_eq!(frame.as_bytes(), &[0xFF, 0x3F]);
    }

    // Encode scales by 32767 and truncates; decode divides by 32768. The two
    // together stay within two LSBs of the original.
    #[test]
    fn decode_recovers_samples_within_quantisation_error() {
        let samples: Vec<f32> = (0..2000)
            .map(|i| ((i as f32) * 0.013).sin() * 0.9)
            .chain([1.0, -1.0, 0.0])
            .collect();
        let block = AudioBlock::new(samples.clone(), 16_000);
        let decoded = decode(&encode(&block), 16_000);

        assert_eq!(decoded.sample_rate, 16_000);
        assert_eq!(decoded.samples.len(), samples.len());
        for (orig, back) in samples.iter().zip(&decoded.samples) {
            assert_abs_diff_eq!(*orig, *back, epsilon = 2.0 / 32_768.0);
        }
    }

    #[test]
    fn decode_drops_trailing_odd_byte() {
        let frame = EncodedFrame::from_bytes(vec![0x00, 0x40, 0x7F]);
        let block = decode(&frame, 24_000);
        assert_eq!(block.samples, vec![0.5]);
    }

    #[test]
    fn transport_text_round_trips_every_length() {
        for len in [0usize, 1, 2, 3, 4, 5, 255, 8192] {
            let bytes: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();
            let frame = EncodedFrame::from_bytes(bytes);
            let text = to_transport_text(&frame);
            assert_eq!(from_transport_text(&text).unwrap(), frame, "len={len}");
        }
    }

    #[test]
    fn transport_text_rejects_garbage() {
        assert!(from_transport_text("not base64 at all!").is_err());
    }

    #[test]
    fn volume_of_silence_is_zero() {
        assert_eq!(volume_metric(&[0.0; 4096]), 0.0);
        assert_eq!(volume_metric(&[]), 0.0);
    }

    #[test]
    fn volume_is_scaled_and_clamped() {
        // RMS of a constant 0.1 signal is 0.1 → 0.5 after gain.
        assert_abs_diff_eq!(volume_metric(&[0.1; 256]), 0.5, epsilon = 1e-5);
        assert_eq!(volume_metric(&[0.8; 256]), 1.0);
    }
}
