//! Microphone capture via `cpal`.
//!
//! [`AudioCapture`] wraps the cpal host/device/stream lifecycle.  The cpal
//! callback runs the [`MonoMixer`] and [`Resampler`] in place and forwards
//! each resulting [`AudioFrame`] over an unbounded channel; the returned
//! [`StreamHandle`] is a RAII guard whose drop stops the hardware stream.
//!
//! [`Microphone`] / [`MicStream`] form the seam between the session and the
//! device layer, so the session state machine can be exercised without any
//! audio hardware.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use thiserror::Error;
use tokio::sync::mpsc;

use super::resample::{MonoMixer, Resampler, SilenceThreshold};

// ---------------------------------------------------------------------------
// AudioFrame
// ---------------------------------------------------------------------------

/// One immutable buffer of 16 kHz mono i16 PCM, produced by a single capture
/// callback invocation.
///
/// Ownership transfers to the transport on send; the samples are never
/// modified after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
}

impl AudioFrame {
    /// Build a frame by copying `samples`.
    pub fn from_samples(samples: &[i16]) -> Self {
        Self {
            samples: samples.to_vec(),
        }
    }

    /// Number of samples in the frame.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` when the frame holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Size of the frame on the wire in bytes (two bytes per sample).
    pub fn byte_len(&self) -> usize {
        self.samples.len() * 2
    }

    /// The raw samples.
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Serialize to the wire format: little-endian i16, no header.
    pub fn into_le_bytes(self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for s in self.samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        bytes
    }
}

/// Channel endpoint the capture callback writes frames into.
pub type FrameSender = mpsc::UnboundedSender<AudioFrame>;

// ---------------------------------------------------------------------------
// CaptureError
// ---------------------------------------------------------------------------

/// Errors that can occur while acquiring or starting the microphone.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    /// The platform refused access to the input device.
    #[error("microphone access denied: {0}")]
    PermissionDenied(String),

    /// No input device is present, or the device cannot be used.
    #[error("input device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The device rejected the requested stream configuration.
    #[error("failed to build input stream: {0}")]
    BuildStream(String),

    /// The stream was built but could not be started.
    #[error("failed to start input stream: {0}")]
    PlayStream(String),
}

impl From<cpal::BuildStreamError> for CaptureError {
    fn from(e: cpal::BuildStreamError) -> Self {
        match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                CaptureError::DeviceUnavailable("device disappeared".into())
            }
            cpal::BuildStreamError::BackendSpecific { err } => {
                let msg = err.to_string();
                if msg.to_lowercase().contains("denied") {
                    CaptureError::PermissionDenied(msg)
                } else {
                    CaptureError::BuildStream(msg)
                }
            }
            other => CaptureError::BuildStream(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// StreamHandle
// ---------------------------------------------------------------------------

/// RAII guard that keeps the cpal input stream alive.
///
/// Dropping this value stops the underlying hardware stream and releases
/// the device.
pub struct StreamHandle {
    _stream: cpal::Stream,
}

// ---------------------------------------------------------------------------
// AudioCapture
// ---------------------------------------------------------------------------

/// Microphone capture wrapper built on top of `cpal`.
///
/// Constructing an [`AudioCapture`] acquires the default input device;
/// [`AudioCapture::start`] builds and starts the stream.
pub struct AudioCapture {
    device: cpal::Device,
    config: cpal::StreamConfig,
    /// Native sample rate reported by the device (Hz).
    sample_rate: u32,
    /// Number of interleaved channels reported by the device.
    channels: u16,
}

impl AudioCapture {
    /// Acquire the system default input device.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::DeviceUnavailable`] when no input device
    /// exists or it cannot report a default configuration.
    pub fn new() -> Result<Self, CaptureError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| CaptureError::DeviceUnavailable("no default input device".into()))?;

        let supported = device
            .default_input_config()
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

        let channels = supported.channels();
        let sample_rate = supported.sample_rate().0;
        let config: cpal::StreamConfig = supported.into();

        Ok(Self {
            device,
            config,
            sample_rate,
            channels,
        })
    }

    /// Native sample rate of the capture stream in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of interleaved channels the device delivers.
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Build and start the capture stream.
    ///
    /// The cpal callback runs on a dedicated audio thread.  Each invocation
    /// downmixes to mono, resamples to 16 kHz i16 and sends one
    /// [`AudioFrame`] over `frames`.  Nothing is sent while `armed` is
    /// `false`, and send errors (receiver dropped) are ignored so the audio
    /// thread never panics.  The callback performs no locking and no I/O;
    /// its only allocation is the frame buffer itself.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::BuildStream`] or [`CaptureError::PlayStream`]
    /// if the platform rejects the stream.
    pub fn start(
        &self,
        frames: FrameSender,
        armed: Arc<AtomicBool>,
    ) -> Result<StreamHandle, CaptureError> {
        let mut mixer = MonoMixer::new(self.channels);
        let mut resampler = Resampler::new(self.sample_rate);

        let stream = self.device.build_input_stream(
            &self.config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if !armed.load(Ordering::Acquire) {
                    return;
                }

                let mono = mixer.mix(data);
                let pcm = resampler.process(mono);
                if pcm.is_empty() {
                    return;
                }

                let _ = frames.send(AudioFrame::from_samples(pcm));
            },
            |err: cpal::StreamError| {
                log::error!("input stream error: {err}");
            },
            None,
        )?;

        stream
            .play()
            .map_err(|e| CaptureError::PlayStream(e.to_string()))?;

        log::debug!(
            "capture started ({} Hz, {} ch)",
            self.sample_rate,
            self.channels
        );

        Ok(StreamHandle { _stream: stream })
    }
}

// ---------------------------------------------------------------------------
// Microphone / MicStream seam
// ---------------------------------------------------------------------------

/// Device layer as seen by the session: acquire a microphone, which may
/// fail with [`CaptureError::PermissionDenied`] or
/// [`CaptureError::DeviceUnavailable`].
pub trait Microphone {
    /// Request microphone access and return an unstarted stream.
    fn acquire(&self) -> Result<Box<dyn MicStream>, CaptureError>;
}

/// An acquired microphone.  Dropping the value releases the device and, if
/// started, stops the stream.
pub trait MicStream {
    /// Start delivering frames into `frames`.  Frames are only produced
    /// while `armed` is `true`; the session clears the flag before teardown
    /// so no frame can be produced after teardown begins.
    fn start(
        &mut self,
        frames: FrameSender,
        armed: Arc<AtomicBool>,
        threshold: Arc<SilenceThreshold>,
    ) -> Result<(), CaptureError>;
}

/// Production [`Microphone`] backed by cpal.
pub struct CpalMicrophone;

impl Microphone for CpalMicrophone {
    fn acquire(&self) -> Result<Box<dyn MicStream>, CaptureError> {
        Ok(Box::new(CpalMicStream {
            capture: AudioCapture::new()?,
            handle: None,
            threshold: None,
        }))
    }
}

struct CpalMicStream {
    capture: AudioCapture,
    handle: Option<StreamHandle>,
    /// Carried so mid-stream adjustments stay visible to the capture path;
    /// the resampling callback does not gate frames on it.
    #[allow(dead_code)]
    threshold: Option<Arc<SilenceThreshold>>,
}

impl MicStream for CpalMicStream {
    fn start(
        &mut self,
        frames: FrameSender,
        armed: Arc<AtomicBool>,
        threshold: Arc<SilenceThreshold>,
    ) -> Result<(), CaptureError> {
        self.threshold = Some(threshold);
        self.handle = Some(self.capture.start(frames, armed)?);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockMicrophone  (test-only)
// ---------------------------------------------------------------------------

/// Test double for the device layer.
///
/// `MockMicrophone::ok()` hands out streams that record the frame sender and
/// armed flag so tests can inject frames as if the audio thread produced
/// them; `MockMicrophone::failing(..)` simulates an acquisition failure.
#[cfg(test)]
pub(crate) struct MockMicrophone {
    fail: Option<CaptureError>,
    pub(crate) taps: Arc<std::sync::Mutex<Vec<MicTap>>>,
    /// One release flag per acquired stream, pushed at acquire time, set on
    /// drop.
    pub(crate) releases: Arc<std::sync::Mutex<Vec<Arc<AtomicBool>>>>,
}

/// Endpoints captured from a started mock stream.
#[cfg(test)]
pub(crate) struct MicTap {
    pub(crate) frames: FrameSender,
    pub(crate) armed: Arc<AtomicBool>,
    pub(crate) released: Arc<AtomicBool>,
}

#[cfg(test)]
impl MockMicrophone {
    pub(crate) fn ok() -> Self {
        Self {
            fail: None,
            taps: Arc::new(std::sync::Mutex::new(Vec::new())),
            releases: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn failing(error: CaptureError) -> Self {
        Self {
            fail: Some(error),
            ..Self::ok()
        }
    }
}

#[cfg(test)]
impl Microphone for MockMicrophone {
    fn acquire(&self) -> Result<Box<dyn MicStream>, CaptureError> {
        if let Some(err) = &self.fail {
            return Err(err.clone());
        }
        let released = Arc::new(AtomicBool::new(false));
        self.releases.lock().unwrap().push(Arc::clone(&released));
        Ok(Box::new(MockMicStream {
            taps: Arc::clone(&self.taps),
            released,
        }))
    }
}

#[cfg(test)]
struct MockMicStream {
    taps: Arc<std::sync::Mutex<Vec<MicTap>>>,
    released: Arc<AtomicBool>,
}

#[cfg(test)]
impl MicStream for MockMicStream {
    fn start(
        &mut self,
        frames: FrameSender,
        armed: Arc<AtomicBool>,
        _threshold: Arc<SilenceThreshold>,
    ) -> Result<(), CaptureError> {
        self.taps.lock().unwrap().push(MicTap {
            frames,
            armed,
            released: Arc::clone(&self.released),
        });
        Ok(())
    }
}

#[cfg(test)]
impl Drop for MockMicStream {
    fn drop(&mut self) {
        self.released.store(true, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_to_le_bytes() {
        let frame = AudioFrame::from_samples(&[0x0102, -2]);
        assert_eq!(frame.byte_len(), 4);
        assert_eq!(frame.into_le_bytes(), vec![0x02, 0x01, 0xFE, 0xFF]);
    }

    #[test]
    fn frame_len_and_empty() {
        let frame = AudioFrame::from_samples(&[]);
        assert!(frame.is_empty());
        assert_eq!(frame.len(), 0);

        let frame = AudioFrame::from_samples(&[1, 2, 3]);
        assert_eq!(frame.len(), 3);
        assert_eq!(frame.byte_len(), 6);
    }

    /// `AudioFrame` must be `Send` so it can cross to the transport task.
    #[test]
    fn audio_frame_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<AudioFrame>();
    }

    #[test]
    fn capture_error_display() {
        let e = CaptureError::PermissionDenied("blocked by user".into());
        assert!(e.to_string().contains("denied"));

        let e = CaptureError::DeviceUnavailable("unplugged".into());
        assert!(e.to_string().contains("unavailable"));
    }

    #[test]
    fn mock_microphone_reports_configured_failure() {
        let mic = MockMicrophone::failing(CaptureError::PermissionDenied("no".into()));
        let err = mic.acquire().err().expect("must fail");
        assert!(matches!(err, CaptureError::PermissionDenied(_)));
    }

    #[test]
    fn mock_stream_records_tap_and_release() {
        let mic = MockMicrophone::ok();
        let mut stream = mic.acquire().expect("acquire");

        let (tx, _rx) = mpsc::unbounded_channel();
        let armed = Arc::new(AtomicBool::new(false));
        stream
            .start(tx, Arc::clone(&armed), Arc::new(SilenceThreshold::default()))
            .expect("start");

        let released = {
            let taps = mic.taps.lock().unwrap();
            assert_eq!(taps.len(), 1);
            Arc::clone(&taps[0].released)
        };
        assert!(!released.load(Ordering::Acquire));

        drop(stream);
        assert!(released.load(Ordering::Acquire));
    }
}
