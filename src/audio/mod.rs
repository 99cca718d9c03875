//! # Audio Module
//!
//! Everything that touches samples: the codec between float samples and the
//! wire format, the capture pipeline feeding the connection, and the playback
//! scheduler that keeps reply audio gapless.
//!
//! ## Key Components:
//! - **Codec**: float ↔ 16-bit little-endian PCM ↔ base64
//! - **Frame Accumulator**: fixed-size windowing of microphone blocks
//! - **Capture Pipeline**: background task turning mic blocks into wire frames
//! - **Playback Scheduler**: back-to-back scheduling against the output clock
//! - **Devices**: context / clock / microphone traits and software backends
//!
//! ## Audio Format:
//! - **Capture**: 16 kHz, mono, 16-bit PCM on the wire
//! - **Playback**: 24 kHz, mono, 16-bit PCM on the wire

pub mod buffer;   // Fixed-size windowing of capture samples
pub mod capture;  // Microphone → wire frames
pub mod codec;    // PCM conversions
pub mod device;   // Device traits
pub mod playback; // Gapless reply scheduling
pub mod software; // File- and clock-backed devices
