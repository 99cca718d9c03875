//! # PCM Codec
//!
//! Pure conversions between the three shapes audio takes in a session:
//!
//! - **Raw samples**: native `f32` samples in `[-1.0, 1.0]` as captured or played
//! - **Wire frames**: 16-bit signed little-endian PCM, base64 text envelope
//! - **Playable frames**: raw samples tagged with sample rate and channel count
//!
//! Nothing in here holds state; every call allocates its own output.

use crate::error::DecodeError;
use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use std::time::Duration;

const ENCODE_SCALE: f32 = 32767.0;
const DECODE_SCALE: f32 = 32768.0;

/// A window of mono samples with its format metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Samples in `[-1.0, 1.0]`
    pub samples: Vec<f32>,

    /// Samples per second (16000 for capture, 24000 for replies)
    pub sample_rate: u32,

    /// Channel count (always 1 in this client)
    pub channels: u16,
}

impl AudioFrame {
    /// Number of sample frames (samples per channel).
    pub fn len(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback length of this frame.
    ///
    /// Computed in integer nanoseconds so that back-to-back frames add up
    /// exactly (4800 samples at 24 kHz is exactly 200 ms).
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let nanos = self.len() as u128 * 1_000_000_000 / self.sample_rate as u128;
        Duration::from_nanos(nanos as u64)
    }

    /// Root-mean-square level of the frame, in `[0.0, 1.0]`.
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f32 = self.samples.iter().map(|s| s * s).sum();
        (sum / self.samples.len() as f32).sqrt()
    }

    /// Largest absolute sample value.
    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
    }
}

/// A frame ready for the network: base64 of little-endian `i16` samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    /// Base64 text envelope
    pub data: String,

    /// Sample rate the payload was captured at
    pub sample_rate: u32,
}

impl WireFrame {
    /// MIME type announced alongside the payload, e.g. `audio/pcm;rate=16000`.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

/// Encode raw capture samples into a wire frame.
///
/// Each sample becomes `round(clamp(s, -1, 1) * 32767)` packed little-endian,
/// then the byte buffer is base64 encoded.
///
/// ## Errors:
/// - **EmptyFrame**: the input had no samples
pub fn encode(samples: &[f32], sample_rate: u32) -> Result<WireFrame, DecodeError> {
    if samples.is_empty() {
        return Err(DecodeError::EmptyFrame);
    }

    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // NaN clamps to NaN and casts to 0
        let value = (sample.clamp(-1.0, 1.0) * ENCODE_SCALE).round() as i16;
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(value);
    }

    Ok(WireFrame {
        data: base64::engine::general_purpose::STANDARD.encode(&bytes),
        sample_rate,
    })
}

/// Decode a base64 envelope of little-endian `i16` samples into floats.
///
/// An envelope that decodes to zero bytes yields an empty vector: the message
/// carried no audio and the caller skips it.
///
/// ## Errors:
/// - **Envelope**: the text is not valid base64
/// - **OddLength**: the payload does not hold whole 16-bit samples
pub fn decode(envelope: &str) -> Result<Vec<f32>, DecodeError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(envelope.trim())
        .map_err(|e| DecodeError::Envelope(e.to_string()))?;

    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }

    let mut cursor = Cursor::new(bytes.as_slice());
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(value) = cursor.read_i16::<LittleEndian>() {
        samples.push(value as f32 / DECODE_SCALE);
    }
    Ok(samples)
}

/// Wrap decoded samples with their format so the scheduler can time them.
pub fn build_playable_buffer(samples: Vec<f32>, sample_rate: u32, channels: u16) -> AudioFrame {
    AudioFrame {
        samples,
        sample_rate,
        channels,
    }
}
