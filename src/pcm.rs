//! PCM16 conversion helpers.
//!
//! The wire format is 16-bit little-endian PCM, base64 encoded: 16 kHz mono
//! for microphone input, 24 kHz mono for synthesized output.

use crate::error::{LiveError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Microphone input sample rate expected by the remote endpoint.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of synthesized audio returned by the remote endpoint.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Quantize one float sample in [-1, 1] to PCM16.
///
/// Positive values scale by 32767 and negative by 32768, matching the
/// asymmetric signed 16-bit range.
pub fn quantize(sample: f32) -> i16 {
    let x = sample.clamp(-1.0, 1.0);
    if x >= 0.0 {
        (x * 32767.0).round() as i16
    } else {
        (x * 32768.0).round() as i16
    }
}

/// Expand a PCM16 sample back to a float in [-1, 1].
pub fn dequantize(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

/// Root-mean-square amplitude of a buffer, clamped to [0, 1].
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt().clamp(0.0, 1.0)
}

/// Encode float samples as base64 PCM16 LE for transmission.
pub fn encode_chunk(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        bytes.extend_from_slice(&quantize(s).to_le_bytes());
    }
    BASE64.encode(bytes)
}

/// Decode a base64 PCM16 LE chunk into float samples.
pub fn decode_chunk(data: &str) -> Result<Vec<f32>> {
    let bytes = BASE64
        .decode(data)
        .map_err(|e| LiveError::Decode(format!("invalid base64: {e}")))?;
    if bytes.len() % 2 != 0 {
        return Err(LiveError::Decode(format!(
            "odd PCM16 byte length: {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| dequantize(i16::from_le_bytes([pair[0], pair[1]])))
        .collect())
}
