//! PCM16 wire codec.
//!
//! The live service exchanges audio as base64 text wrapping little-endian
//! signed 16-bit samples. Captured audio is `f32` in [-1.0, 1.0]; scaling uses
//! a factor of 32768 in both directions so a decoded sample is within one
//! quantization step of the captured sample.

use crate::error::VoiceResult;
use base64::{engine::general_purpose::STANDARD, Engine};

/// Scale factor between normalized floats and 16-bit integers.
pub const PCM16_SCALE: f32 = 32768.0;

/// Quantize one normalized sample to `i16`.
///
/// Values that scale past the representable range saturate instead of
/// wrapping, so a full-scale `1.0` becomes `i16::MAX` rather than `i16::MIN`.
pub fn quantize(sample: f32) -> i16 {
    let scaled = (sample * PCM16_SCALE).round();
    if scaled.is_nan() {
        return 0;
    }
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Encode a block of normalized samples as base64 PCM16 little-endian.
pub fn encode_pcm16(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&quantize(sample).to_le_bytes());
    }
    STANDARD.encode(bytes)
}

/// Decode base64 PCM16 little-endian into normalized samples.
///
/// A trailing odd byte cannot form a sample and is ignored.
pub fn decode_pcm16(payload: &str) -> VoiceResult<Vec<f32>> {
    let bytes = STANDARD.decode(payload.trim())?;
    if bytes.len() % 2 != 0 {
        tracing::debug!(len = bytes.len(), "PCM payload has a trailing odd byte");
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / PCM16_SCALE)
        .collect())
}

/// Duration in seconds of `sample_count` mono samples at `sample_rate`.
pub fn duration_secs(sample_count: usize, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    sample_count as f64 / sample_rate as f64
}
