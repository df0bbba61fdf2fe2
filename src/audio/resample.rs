//! Sample-rate conversion for the outbound PCM stream.
//!
//! The remote recognizer requires **16 kHz mono 16-bit** PCM.  [`Resampler`]
//! converts whatever the capture device delivers (`f32` in `[-1.0, 1.0]` at
//! the device's native rate) into that format using nearest-neighbor
//! decimation, and [`MonoMixer`] downmixes interleaved channels first.
//!
//! Both run inside the real-time capture callback, so neither allocates in
//! steady state: each owns a scratch buffer that grows once and is reused
//! on every call.

use std::sync::atomic::{AtomicU32, Ordering};

/// Sample rate of the outbound PCM stream in Hz.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Upper bound accepted for the silence threshold.
pub const SILENCE_THRESHOLD_MAX: f32 = 0.01;

// ---------------------------------------------------------------------------
// Resampler
// ---------------------------------------------------------------------------

/// Nearest-neighbor decimator from the device rate to 16 kHz i16.
///
/// For output index `i` the source sample is taken at index
/// `floor(i * input_rate / 16000)`; the sample is clamped to `[-1.0, 1.0]`,
/// scaled by `32767` and truncated to `i16`.  The output length is always
/// `floor(len * 16000 / input_rate)`.
///
/// # Example
///
/// ```rust
/// use voice_chat::audio::Resampler;
///
/// let mut rs = Resampler::new(48_000);
/// let block = vec![0.5_f32; 480]; // 10 ms at 48 kHz
/// let pcm = rs.process(&block);
/// assert_eq!(pcm.len(), 160);     // 10 ms at 16 kHz
/// ```
pub struct Resampler {
    input_rate: u32,
    scratch: Vec<i16>,
}

impl Resampler {
    /// Create a resampler for a device running at `input_rate` Hz.
    ///
    /// # Panics
    ///
    /// Panics if `input_rate == 0`.
    pub fn new(input_rate: u32) -> Self {
        assert!(input_rate > 0, "input_rate must be > 0");
        Self {
            input_rate,
            scratch: Vec::new(),
        }
    }

    /// Device sample rate this resampler was built for.
    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    /// Convert one block of native-rate samples to 16 kHz i16 PCM.
    ///
    /// The returned slice borrows the internal scratch buffer and is valid
    /// until the next `process` call.  An empty input yields an empty
    /// output; this function never fails.
    pub fn process(&mut self, input: &[f32]) -> &[i16] {
        let out_len =
            (input.len() as u64 * u64::from(TARGET_SAMPLE_RATE) / u64::from(self.input_rate))
                as usize;

        self.scratch.clear();
        self.scratch.reserve(out_len);

        for i in 0..out_len {
            let src = (i as u64 * u64::from(self.input_rate) / u64::from(TARGET_SAMPLE_RATE))
                as usize;
            let s = input[src].clamp(-1.0, 1.0);
            self.scratch.push((s * 32767.0) as i16);
        }

        &self.scratch
    }
}

// ---------------------------------------------------------------------------
// MonoMixer
// ---------------------------------------------------------------------------

/// Downmixes interleaved multi-channel audio to mono by averaging channels.
///
/// Mono input is passed through without copying.
pub struct MonoMixer {
    channels: u16,
    scratch: Vec<f32>,
}

impl MonoMixer {
    /// Create a mixer for a device with `channels` interleaved channels.
    ///
    /// # Panics
    ///
    /// Panics if `channels == 0`.
    pub fn new(channels: u16) -> Self {
        assert!(channels > 0, "channels must be > 0");
        Self {
            channels,
            scratch: Vec::new(),
        }
    }

    /// Downmix one interleaved block.  The output length is
    /// `samples.len() / channels`.
    pub fn mix<'a>(&'a mut self, samples: &'a [f32]) -> &'a [f32] {
        if self.channels == 1 {
            return samples;
        }

        let n = self.channels as usize;
        self.scratch.clear();
        self.scratch.reserve(samples.len() / n);

        for frame in samples.chunks_exact(n) {
            self.scratch.push(frame.iter().sum::<f32>() / n as f32);
        }

        &self.scratch
    }
}

// ---------------------------------------------------------------------------
// SilenceThreshold
// ---------------------------------------------------------------------------

/// Advisory silence threshold, adjustable at any time, including while a
/// capture stream is running.
///
/// The value is clamped to `[0.0, SILENCE_THRESHOLD_MAX]` on every store.
/// The capture path carries the current value but does not gate frames on
/// it; no voice-activity decision is made anywhere in the pipeline.
pub struct SilenceThreshold(AtomicU32);

impl SilenceThreshold {
    /// Create a threshold initialised to `value` (clamped).
    pub fn new(value: f32) -> Self {
        let t = Self(AtomicU32::new(0));
        t.set(value);
        t
    }

    /// Store a new value, clamped to `[0.0, SILENCE_THRESHOLD_MAX]`.
    pub fn set(&self, value: f32) {
        let clamped = value.clamp(0.0, SILENCE_THRESHOLD_MAX);
        self.0.store(clamped.to_bits(), Ordering::Release);
    }

    /// Current value.
    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Acquire))
    }
}

impl Default for SilenceThreshold {
    fn default() -> Self {
        Self::new(0.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
