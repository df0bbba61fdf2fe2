//! Playback of inbound synthesized speech.
//!
//! Inbound binary payloads are WAV-encoded audio from the remote
//! synthesizer.  [`decode_wav`] turns a payload into mono `f32` samples and
//! [`PlaybackScheduler`] plays decoded payloads one after another, in
//! arrival order, on a worker task so neither capture nor dispatch ever
//! waits on the output device.
//!
//! [`PlaybackSink`] is the seam to the output device; [`DevicePlayback`] is
//! the cpal-backed production implementation.

use std::io::Cursor;
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleRate;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// PlaybackError
// ---------------------------------------------------------------------------

/// Errors that can occur while decoding or playing an inbound payload.
///
/// All of these are recoverable: the offending payload is discarded and the
/// session continues.
#[derive(Debug, Error)]
pub enum PlaybackError {
    /// The payload is not decodable audio.
    #[error("undecodable audio payload: {0}")]
    Decode(String),

    /// No output device, or it cannot satisfy the payload's format.
    #[error("output device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The device rejected the output stream.
    #[error("failed to build output stream: {0}")]
    BuildStream(String),

    /// The stream was built but could not be started.
    #[error("failed to start output stream: {0}")]
    PlayStream(String),
}

// ---------------------------------------------------------------------------
// DecodedAudio / decode_wav
// ---------------------------------------------------------------------------

/// A decoded payload: mono `f32` samples in `[-1.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    /// Payload duration in seconds.
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// Decode a WAV payload to mono `f32`.
///
/// Accepts 16-bit integer and 32-bit float WAV; multi-channel audio is
/// downmixed by averaging.
///
/// # Errors
///
/// Returns [`PlaybackError::Decode`] for anything that is not a well-formed
/// WAV stream in a supported format.
pub fn decode_wav(bytes: &[u8]) -> Result<DecodedAudio, PlaybackError> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| PlaybackError::Decode(e.to_string()))?;
    let spec = reader.spec();

    if spec.channels == 0 {
        return Err(PlaybackError::Decode("zero channels".into()));
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            if spec.bits_per_sample != 16 {
                return Err(PlaybackError::Decode(format!(
                    "unsupported bit depth: {}",
                    spec.bits_per_sample
                )));
            }
            reader
                .samples::<i16>()
                .map(|s| s.map(|v| f32::from(v) / 32768.0))
                .collect::<Result<_, _>>()
                .map_err(|e| PlaybackError::Decode(e.to_string()))?
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| PlaybackError::Decode(e.to_string()))?,
    };

    let channels = spec.channels as usize;
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };

    Ok(DecodedAudio {
        samples,
        sample_rate: spec.sample_rate,
    })
}

// ---------------------------------------------------------------------------
// PlaybackSink
// ---------------------------------------------------------------------------

/// Output-device seam.  Implementations must be `Send + Sync` so the
/// playback worker can hold one behind an `Arc<dyn PlaybackSink>`.
pub trait PlaybackSink: Send + Sync {
    /// Play `audio` to completion.  Blocking is fine: the scheduler always
    /// calls this from a blocking-capable worker thread.
    fn play(&self, audio: DecodedAudio) -> Result<(), PlaybackError>;
}

// ---------------------------------------------------------------------------
// DevicePlayback
// ---------------------------------------------------------------------------

/// Plays audio on the system default output device.
///
/// The device is looked up per call, so a session survives the default
/// output changing between payloads.
#[derive(Default)]
pub struct DevicePlayback;

impl PlaybackSink for DevicePlayback {
    fn play(&self, audio: DecodedAudio) -> Result<(), PlaybackError> {
        if audio.samples.is_empty() {
            return Ok(());
        }

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlaybackError::DeviceUnavailable("no default output device".into()))?;

        let rate = SampleRate(audio.sample_rate);
        let supported = device
            .supported_output_configs()
            .map_err(|e| PlaybackError::DeviceUnavailable(e.to_string()))?
            .find(|c| c.channels() == 1 && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
            .or_else(|| {
                // Fallback: stereo output, same sample duplicated per channel.
                device
                    .supported_output_configs()
                    .ok()?
                    .find(|c| {
                        c.channels() == 2
                            && c.min_sample_rate() <= rate
                            && c.max_sample_rate() >= rate
                    })
            })
            .ok_or_else(|| {
                PlaybackError::DeviceUnavailable(format!(
                    "no output config at {} Hz",
                    audio.sample_rate
                ))
            })?;

        let config = supported.with_sample_rate(rate).config();
        let channels = config.channels as usize;

        let duration = std::time::Duration::from_secs_f32(audio.duration_secs());
        let samples = audio.samples;
        let total = samples.len();
        let position = Arc::new(Mutex::new(0_usize));
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let cb_position = Arc::clone(&position);
        let cb_finished = Arc::clone(&finished);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut pos = cb_position.lock().unwrap();
                    for frame in data.chunks_mut(channels) {
                        let sample = if *pos < samples.len() {
                            let s = samples[*pos];
                            *pos += 1;
                            s
                        } else {
                            cb_finished.store(true, std::sync::atomic::Ordering::Release);
                            0.0
                        };
                        for out in frame.iter_mut() {
                            *out = sample;
                        }
                    }
                },
                |err| log::error!("output stream error: {err}"),
                None,
            )
            .map_err(|e| PlaybackError::BuildStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| PlaybackError::PlayStream(e.to_string()))?;

        // Wait until the callback has drained the buffer, bounded by the
        // payload duration plus a little slack.
        let deadline = std::time::Instant::now() + duration + std::time::Duration::from_millis(500);
        while !finished.load(std::sync::atomic::Ordering::Acquire) {
            if std::time::Instant::now() > deadline {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }

        drop(stream);
        log::debug!("playback complete ({total} samples)");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PlaybackScheduler
// ---------------------------------------------------------------------------

/// Serializes decode-and-play of inbound payloads in arrival order.
///
/// Payloads are queued over an unbounded channel; a single worker decodes
/// and plays them one at a time, so playback never overlaps.  A payload
/// that fails to decode or play is logged and discarded without affecting
/// later payloads.
pub struct PlaybackScheduler {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    worker: JoinHandle<()>,
}

impl PlaybackScheduler {
    /// Spawn the worker task on the current tokio runtime.
    pub fn spawn(sink: Arc<dyn PlaybackSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let worker = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                let sink = Arc::clone(&sink);
                let joined = tokio::task::spawn_blocking(move || {
                    let audio = decode_wav(&payload)?;
                    sink.play(audio)
                })
                .await;

                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::warn!("discarding inbound audio payload: {e}"),
                    Err(e) => log::warn!("playback worker join error: {e}"),
                }
            }
        });

        Self { tx, worker }
    }

    /// Queue endpoint for the dispatcher.
    pub fn sender(&self) -> mpsc::UnboundedSender<Vec<u8>> {
        self.tx.clone()
    }

    /// Tear down the worker.  Queued payloads are dropped; a decode or play
    /// already in flight finishes on its blocking thread but its result is
    /// discarded.
    pub async fn shutdown(self) {
        drop(self.tx);
        self.worker.abort();
        let _ = self.worker.await;
    }
}

// ---------------------------------------------------------------------------
// MockSink  (test-only)
// ---------------------------------------------------------------------------

/// Test double that records every decoded payload it is asked to play.
#[cfg(test)]
pub(crate) struct MockSink {
    pub(crate) played: Arc<Mutex<Vec<DecodedAudio>>>,
}

#[cfg(test)]
impl MockSink {
    pub(crate) fn new() -> (Arc<Self>, Arc<Mutex<Vec<DecodedAudio>>>) {
        let played = Arc::new(Mutex::new(Vec::new()));
        (
            Arc::new(Self {
                played: Arc::clone(&played),
            }),
            played,
        )
    }
}

#[cfg(test)]
impl PlaybackSink for MockSink {
    fn play(&self, audio: DecodedAudio) -> Result<(), PlaybackError> {
        self.played.lock().unwrap().push(audio);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
