//! # Audio Codec
//!
//! Converts between the device-native audio representation and the
//! transport-safe [`AudioSample`] carried inside envelopes.
//!
//! ## Conversions:
//! - **encode**: `NativeBuffer` → `AudioSample` (channel 0 only, rate unchanged)
//! - **decode**: `AudioSample` → mono `NativeBuffer`
//! - **encode_pcm16 / decode_pcm16**: `AudioSample` ↔ binary WebSocket frame
//!
//! ## Binary Frame Layout:
//! ```text
//! +----------------------+----------------------------------+
//! | sample rate (u32 LE) | samples (i16 LE, scaled by 32768)|
//! +----------------------+----------------------------------+
//! ```
//!
//! All functions are pure: no I/O, no state between calls, so equal inputs
//! always produce bit-identical outputs.

use crate::error::{StreamError, StreamResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Size of the sample-rate header at the start of a binary frame.
const PCM16_HEADER_BYTES: usize = 4;

/// Transport-safe audio: a sample rate plus a flat, ordered array of mono samples.
///
/// ## Wire Format:
/// ```json
/// { "sampleRate": 16000, "samples": [0.0, 0.25, -0.5] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioSample {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
}

impl AudioSample {
    pub fn new(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            samples,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Zero-length payloads are no-ops on the wire, not errors.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration of the chunk in milliseconds (0 when the rate is unknown).
    pub fn duration_ms(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 * 1000.0 / self.sample_rate as f64
    }

    /// Check the invariants an inbound chunk must satisfy before it reaches a model.
    ///
    /// ## Checks:
    /// 1. **Sample rate**: must be positive
    /// 2. **Finite values**: NaN and infinities are rejected
    /// 3. **Range**: every sample must lie in [-1.0, 1.0]; nothing is clamped
    pub fn validate(&self) -> StreamResult<()> {
        if self.sample_rate == 0 {
            return Err(StreamError::validation("audio", "sampleRate must be greater than 0"));
        }

        if let Some(index) = self.samples.iter().position(|s| !s.is_finite()) {
            return Err(StreamError::validation(
                "audio",
                format!("sample {} is not a finite number", index),
            ));
        }

        if let Some(index) = self.samples.iter().position(|s| !(-1.0..=1.0).contains(s)) {
            return Err(StreamError::validation(
                "audio",
                format!(
                    "sample {} ({}) is outside [-1.0, 1.0]",
                    index, self.samples[index]
                ),
            ));
        }

        Ok(())
    }
}

/// Planar device audio buffer, one `Vec<f32>` per channel.
///
/// Mirrors what capture devices hand out: every channel has the same length and
/// shares one sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeBuffer {
    pub sample_rate: u32,
    pub channels: Vec<Vec<f32>>,
}

impl NativeBuffer {
    /// Allocate a silent buffer.
    pub fn new(sample_rate: u32, channel_count: usize, length: usize) -> Self {
        Self {
            sample_rate,
            channels: vec![vec![0.0; length]; channel_count],
        }
    }

    /// Wrap a single channel of samples.
    pub fn mono(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            channels: vec![samples],
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Frames per channel.
    pub fn len(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }
}

/// Encode a native buffer for transport.
///
/// Reads channel 0 only; additional channels are truncated (mono downmix by
/// truncation). The source sample rate is carried forward unchanged, the audio is
/// never resampled. A buffer without channels encodes to an empty sample.
pub fn encode(buffer: &NativeBuffer) -> AudioSample {
    let samples = buffer.channel(0).map(<[f32]>::to_vec).unwrap_or_default();
    AudioSample::new(buffer.sample_rate, samples)
}

/// Decode a transported sample into a mono native buffer.
///
/// ## Errors:
/// - `samples` is empty
/// - `sample_rate` is 0
pub fn decode(sample: &AudioSample) -> StreamResult<NativeBuffer> {
    if sample.sample_rate == 0 {
        return Err(StreamError::Codec(
            "cannot decode audio with a sample rate of 0".to_string(),
        ));
    }
    if sample.samples.is_empty() {
        return Err(StreamError::Codec("cannot decode an empty sample".to_string()));
    }

    let mut buffer = NativeBuffer::new(sample.sample_rate, 1, sample.samples.len());
    buffer.channels[0].copy_from_slice(&sample.samples);
    Ok(buffer)
}

/// Pack a sample into a binary frame of 16-bit little-endian PCM.
///
/// Floats are scaled by 32768 and clamped to the i16 range.
pub fn encode_pcm16(sample: &AudioSample) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(PCM16_HEADER_BYTES + sample.samples.len() * 2);
    // Writing into a Vec cannot fail.
    let _ = bytes.write_u32::<LittleEndian>(sample.sample_rate);
    for &value in &sample.samples {
        let scaled = (value * 32768.0).clamp(-32768.0, 32767.0) as i16;
        let _ = bytes.write_i16::<LittleEndian>(scaled);
    }
    bytes
}

/// Unpack a binary PCM16 frame.
///
/// ## Errors:
/// - frame shorter than the 4-byte header
/// - odd number of sample bytes (16-bit samples need two bytes each)
pub fn decode_pcm16(frame: &[u8]) -> StreamResult<AudioSample> {
    if frame.len() < PCM16_HEADER_BYTES {
        return Err(StreamError::Codec(format!(
            "binary frame of {} bytes is shorter than the {}-byte header",
            frame.len(),
            PCM16_HEADER_BYTES
        )));
    }
    if (frame.len() - PCM16_HEADER_BYTES) % 2 != 0 {
        return Err(StreamError::Codec(
            "audio data length must be even for 16-bit samples".to_string(),
        ));
    }

    let mut cursor = Cursor::new(frame);
    let sample_rate = cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| StreamError::Codec(e.to_string()))?;

    let mut samples = Vec::with_capacity((frame.len() - PCM16_HEADER_BYTES) / 2);
    while let Ok(value) = cursor.read_i16::<LittleEndian>() {
        samples.push(value as f32 / 32768.0);
    }

    Ok(AudioSample::new(sample_rate, samples))
}
