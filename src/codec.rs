//! Outbound encoder and inbound decoder for PCM audio
//!
//! Capture produces f32 samples which are scaled to little-endian 16-bit PCM
//! and base64 encoded. Agent replies travel the reverse path.

use crate::error::{SessionError, SessionResult};
use crate::models::{AudioBuffer, AudioChunk, EncodedFrame};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use std::ops::RangeInclusive;

/// Sample rates accepted for agent audio
pub const SUPPORTED_SAMPLE_RATES: RangeInclusive<u32> = 8000..=48000;

/// Convert one float sample in [-1.0, 1.0] to 16-bit PCM
///
/// Values outside the range are clamped, so `1.0` maps to `32767` instead of
/// wrapping around. NaN maps to silence.
pub fn f32_to_pcm16(sample: f32) -> i16 {
    (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

pub fn pcm16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

pub fn encode_base64(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

pub fn decode_base64(data: &str) -> SessionResult<Vec<u8>> {
    Ok(B64.decode(data)?)
}

/// Little-endian byte layout of a PCM slice
pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Serialize a capture chunk for the session channel
pub fn encode_chunk(chunk: &AudioChunk) -> EncodedFrame {
    EncodedFrame {
        data: encode_base64(&pcm16_to_bytes(chunk.samples())),
        mime_type: chunk.mime_type(),
    }
}

/// Interpret raw bytes as interleaved 16-bit PCM and normalize to floats
pub fn decode_pcm16(bytes: &[u8], sample_rate: u32, channels: u16) -> SessionResult<AudioBuffer> {
    if bytes.len() % 2 != 0 {
        return Err(SessionError::MalformedAudio(format!(
            "{} bytes is not a whole number of 16-bit samples",
            bytes.len()
        )));
    }
    let channels = channels.max(1);
    let sample_count = bytes.len() / 2;
    if sample_count % channels as usize != 0 {
        return Err(SessionError::MalformedAudio(format!(
            "{} samples do not split into {} channels",
            sample_count, channels
        )));
    }

    let data = bytes
        .chunks_exact(2)
        .map(|pair| pcm16_to_f32(i16::from_le_bytes([pair[0], pair[1]])))
        .collect();

    Ok(AudioBuffer {
        sample_rate,
        channels,
        data,
    })
}

/// Base64 text to a playable buffer
pub fn decode_audio(data: &str, sample_rate: u32, channels: u16) -> SessionResult<AudioBuffer> {
    if !SUPPORTED_SAMPLE_RATES.contains(&sample_rate) {
        return Err(SessionError::MalformedAudio(format!(
            "unsupported sample rate {}Hz",
            sample_rate
        )));
    }
    let bytes = decode_base64(data)?;
    decode_pcm16(&bytes, sample_rate, channels)
}

/// Extract the `rate=` parameter from a MIME descriptor such as `audio/pcm;rate=24000`
pub fn mime_sample_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
}
