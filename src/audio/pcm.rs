// PCM conversion helpers shared by the capture and playback paths.
//
// The transport carries uncompressed 16-bit little-endian PCM wrapped in a
// text-safe base64 payload. Everything here is a pure function: same input,
// same output, no device or network access.

use base64::Engine;

use crate::error::DecodeError;

/// Convert normalized `f32` samples to 16-bit signed PCM.
///
/// Inputs are clamped to `[-1.0, 1.0]` rather than erroring, then scaled by
/// 32768 and truncated. `-1.0` maps to `i16::MIN`; `1.0` (and anything above)
/// saturates at `i16::MAX`.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let scaled = s.clamp(-1.0, 1.0) * 32768.0;
            scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
        })
        .collect()
}

/// Convert 16-bit signed PCM back to normalized `f32` samples.
pub fn pcm16_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Serialize i16 samples as little-endian bytes.
pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Parse little-endian bytes back into i16 samples.
///
/// An odd byte count means the payload was truncated mid-sample and is
/// rejected as a decode failure.
pub fn bytes_to_pcm16(bytes: &[u8]) -> Result<Vec<i16>, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect())
}

/// Encode raw bytes into the transport-safe text form.
pub fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decode the transport text form back into raw bytes.
pub fn decode_base64(text: &str) -> Result<Vec<u8>, DecodeError> {
    Ok(base64::engine::general_purpose::STANDARD.decode(text)?)
}
