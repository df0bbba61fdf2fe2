//! Audio path — microphone capture, resampling, and playback.
//!
//! # Outbound
//!
//! ```text
//! Microphone → cpal callback → MonoMixer → Resampler → AudioFrame (channel)
//! ```
//!
//! The callback runs on the audio thread and must finish within its time
//! budget: no locks, no I/O, scratch buffers reused across calls.
//!
//! # Inbound
//!
//! ```text
//! WAV payload → decode_wav → PlaybackScheduler → PlaybackSink (cpal output)
//! ```
//!
//! Payloads play serially in arrival order on a worker task.

pub mod capture;
pub mod playback;
pub mod resample;

pub use capture::{
    AudioCapture, AudioFrame, CaptureError, CpalMicrophone, FrameSender, MicStream, Microphone,
    StreamHandle,
};
pub use playback::{
    decode_wav, DecodedAudio, DevicePlayback, PlaybackError, PlaybackScheduler, PlaybackSink,
};
pub use resample::{
    MonoMixer, Resampler, SilenceThreshold, SILENCE_THRESHOLD_MAX, TARGET_SAMPLE_RATE,
};
