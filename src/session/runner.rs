//! Capture session — owns every resource of a listening session and drives
//! the start/stop state machine.
//!
//! # Session flow
//!
//! ```text
//! start()                              stop()
//!   ├─ acquire microphone               ├─ disarm capture callback
//!   ├─ connect transport                ├─ drop microphone stream
//!   ├─ reset byte counters              ├─ close transport
//!   ├─ start capture stream             ├─ join dispatcher
//!   ├─ spawn playback + dispatcher      └─ tear down playback worker
//!   └─ arm the callback
//! ```
//!
//! Any failure during `start()` rolls back everything acquired so far and
//! leaves the session `Idle`; both calls are idempotent no-ops in the wrong
//! state.  The callback is disarmed before any resource is released, so no
//! frame can be produced once teardown has begun, and work still in flight
//! when `stop()` returns can only ever be discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audio::{
    CaptureError, MicStream, Microphone, PlaybackScheduler, PlaybackSink, SilenceThreshold,
};
use crate::config::AppConfig;
use crate::net::{Connector, Dispatcher, Transport, TransportError, TransportLink};
use crate::transcript::{new_shared_transcript, SharedTranscript, TranscriptLog};

use super::state::{ByteCounters, ClientEvent, SessionState};

// ---------------------------------------------------------------------------
// SessionError
// ---------------------------------------------------------------------------

/// Failures that abort `start()`.  The session is `Idle` again when one of
/// these is returned; no partial resource survives.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ---------------------------------------------------------------------------
// CaptureSession
// ---------------------------------------------------------------------------

/// Resources held only while `Listening`.  Field order mirrors teardown
/// order in [`CaptureSession::stop`].
struct ActiveSession {
    armed: Arc<AtomicBool>,
    mic: Box<dyn MicStream>,
    transport: Transport,
    dispatcher: JoinHandle<()>,
    scheduler: PlaybackScheduler,
    reporter: JoinHandle<()>,
}

/// The client's one capture session.
///
/// Collaborators are injected so the state machine can be exercised
/// without hardware or a network:
///
/// * `microphone` — device layer ([`crate::audio::CpalMicrophone`] in
///   production),
/// * `connector`  — transport layer ([`crate::net::WsConnector`]),
/// * `playback`   — output device ([`crate::audio::DevicePlayback`]).
pub struct CaptureSession {
    config: AppConfig,
    microphone: Box<dyn Microphone>,
    connector: Arc<dyn Connector>,
    playback: Arc<dyn PlaybackSink>,
    events: mpsc::UnboundedSender<ClientEvent>,
    transcript: SharedTranscript,
    counters: Arc<ByteCounters>,
    threshold: Arc<SilenceThreshold>,
    active: Option<ActiveSession>,
}

impl CaptureSession {
    pub fn new(
        config: AppConfig,
        microphone: Box<dyn Microphone>,
        connector: Arc<dyn Connector>,
        playback: Arc<dyn PlaybackSink>,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        let threshold = Arc::new(SilenceThreshold::new(config.audio.silence_threshold));
        Self {
            config,
            microphone,
            connector,
            playback,
            events,
            transcript: new_shared_transcript(),
            counters: Arc::new(ByteCounters::new()),
            threshold,
            active: None,
        }
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    /// Begin listening.  A no-op when already `Listening`.
    ///
    /// # Errors
    ///
    /// [`SessionError::Capture`] when the microphone cannot be acquired or
    /// started, [`SessionError::Transport`] when the connection cannot be
    /// established.  In both cases the session remains `Idle`.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        if self.active.is_some() {
            log::debug!("start ignored: already listening");
            return Ok(());
        }

        let url = self.config.server.url();

        // Microphone access first.  Failure here holds nothing.
        let mut mic = self.microphone.acquire()?;

        // A connect failure drops `mic`, releasing the device.
        let TransportLink { transport, inbound } = self
            .connector
            .connect(&url, Arc::clone(&self.counters))
            .await?;

        self.counters.reset();

        let armed = Arc::new(AtomicBool::new(false));
        if let Err(e) = mic.start(
            transport.sender(),
            Arc::clone(&armed),
            Arc::clone(&self.threshold),
        ) {
            transport.close().await;
            return Err(e.into());
        }

        let scheduler = PlaybackScheduler::spawn(Arc::clone(&self.playback));
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.transcript),
            Arc::clone(&self.counters),
            scheduler.sender(),
            self.events.clone(),
            self.open_transcript_log(),
        );
        let dispatcher = tokio::spawn(dispatcher.run(inbound));
        let reporter = spawn_byte_reporter(Arc::clone(&self.counters));

        armed.store(true, Ordering::Release);
        self.active = Some(ActiveSession {
            armed,
            mic,
            transport,
            dispatcher,
            scheduler,
            reporter,
        });

        log::info!("listening ({url})");
        Ok(())
    }

    /// Stop listening and release everything.  A no-op when `Idle`.
    pub async fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            log::debug!("stop ignored: already idle");
            return;
        };

        // Disarm before releasing anything: no frame may be produced once
        // teardown has begun.
        active.armed.store(false, Ordering::Release);
        drop(active.mic);

        active.reporter.abort();
        let _ = active.reporter.await;

        active.transport.close().await;
        let _ = active.dispatcher.await;
        active.scheduler.shutdown().await;

        let (sent, received) = self.counters.snapshot();
        log::info!("session stopped (sent {sent} bytes, received {received} bytes)");
    }

    // -----------------------------------------------------------------------
    // Observability surface
    // -----------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        if self.active.is_some() {
            SessionState::Listening
        } else {
            SessionState::Idle
        }
    }

    /// The transcript handle the rendering layer reads.
    pub fn transcript(&self) -> SharedTranscript {
        Arc::clone(&self.transcript)
    }

    /// `(sent, received)` byte totals of the current or most recent session.
    pub fn byte_counters(&self) -> (u64, u64) {
        self.counters.snapshot()
    }

    /// Adjust the silence threshold, valid at any time, including while
    /// `Listening`.  The value is clamped to `[0.0, 0.01]`.
    pub fn set_silence_threshold(&self, value: f32) {
        self.threshold.set(value);
    }

    pub fn silence_threshold(&self) -> f32 {
        self.threshold.get()
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn open_transcript_log(&self) -> Option<TranscriptLog> {
        let path = self.config.transcript.log_file.as_ref()?;
        match TranscriptLog::open(path) {
            Ok(log) => Some(log),
            Err(e) => {
                log::warn!("transcript log disabled ({}: {e})", path.display());
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Byte reporter
// ---------------------------------------------------------------------------

/// Periodically log the wire totals, but only when they changed since the
/// previous tick.
fn spawn_byte_reporter(counters: Arc<ByteCounters>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = counters.snapshot();
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(5));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let now = counters.snapshot();
            if now != last {
                log::debug!("wire totals: sent {} bytes, received {} bytes", now.0, now.1);
                last = now;
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::MockMicrophone;
    use crate::audio::playback::MockSink;
    use crate::audio::{AudioFrame, Resampler};
    use crate::net::transport::MockConnector;
    use crate::transcript::{Speaker, Utterance};
    use tokio_tungstenite::tungstenite::Message;

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        // Keep unit tests from writing transcript.log into the tree.
        config.transcript.log_file = None;
        config
    }

    struct Harness {
        session: CaptureSession,
        mic_taps: Arc<std::sync::Mutex<Vec<crate::audio::capture::MicTap>>>,
        mic_releases: Arc<std::sync::Mutex<Vec<Arc<AtomicBool>>>>,
        wire: Arc<std::sync::Mutex<Vec<Message>>>,
        connects: Arc<MockConnector>,
        played: Arc<std::sync::Mutex<Vec<crate::audio::DecodedAudio>>>,
        events: mpsc::UnboundedReceiver<ClientEvent>,
    }

    fn harness_with(connector: MockConnector, config: AppConfig) -> Harness {
        let mic = MockMicrophone::ok();
        let mic_taps = Arc::clone(&mic.taps);
        let mic_releases = Arc::clone(&mic.releases);

        let connector = Arc::new(connector);
        let wire = Arc::clone(&connector.sent);

        let (sink, played) = MockSink::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let session = CaptureSession::new(
            config,
            Box::new(mic),
            Arc::clone(&connector) as Arc<dyn Connector>,
            sink,
            events_tx,
        );

        Harness {
            session,
            mic_taps,
            mic_releases,
            wire,
            connects: connector,
            played,
            events: events_rx,
        }
    }

    fn harness() -> Harness {
        harness_with(MockConnector::silent(), test_config())
    }

    /// Build a 16-bit mono WAV payload.
    fn wav_payload(samples: &[i16], sample_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    fn binary_frames(wire: &std::sync::Mutex<Vec<Message>>) -> Vec<Vec<u8>> {
        wire.lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                Message::Binary(b) => Some(b.clone()),
                _ => None,
            })
            .collect()
    }

    // ---- Lifecycle ---------------------------------------------------------

    /// Full round trip: three 480-sample blocks at 48 kHz leave as three
    /// 160-sample (320-byte) binary messages, and stop releases everything.
    #[tokio::test]
    async fn capture_to_wire_end_to_end() {
        let mut h = harness();
        h.session.start().await.expect("start");
        assert_eq!(h.session.state(), SessionState::Listening);

        // Drive the capture path the way the audio thread would.
        let tap = {
            let taps = h.mic_taps.lock().unwrap();
            assert_eq!(taps.len(), 1);
            assert!(taps[0].armed.load(Ordering::Acquire));
            taps[0].frames.clone()
        };

        let mut resampler = Resampler::new(48_000);
        for _ in 0..3 {
            let block = vec![0.25_f32; 480];
            let pcm = resampler.process(&block);
            assert_eq!(pcm.len(), 160);
            tap.send(AudioFrame::from_samples(pcm)).unwrap();
        }

        wait_for(|| h.session.byte_counters().0 == 3 * 320).await;

        let frames = binary_frames(&h.wire);
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.len() == 320));

        h.session.stop().await;
        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(h.mic_releases.lock().unwrap()[0].load(Ordering::Acquire));
        assert!(h
            .wire
            .lock()
            .unwrap()
            .iter()
            .any(|m| matches!(m, Message::Close(_))));
    }

    #[tokio::test]
    async fn start_twice_is_a_single_session() {
        let mut h = harness();
        h.session.start().await.expect("first start");

        // Traffic before the second call; an actual restart would reset it.
        let tap = h.mic_taps.lock().unwrap()[0].frames.clone();
        tap.send(AudioFrame::from_samples(&vec![1; 160])).unwrap();
        wait_for(|| h.session.byte_counters().0 == 320).await;

        h.session.start().await.expect("second start");
        assert_eq!(h.session.state(), SessionState::Listening);
        assert_eq!(
            h.connects.connects.load(std::sync::atomic::Ordering::Acquire),
            1
        );
        assert_eq!(h.session.byte_counters().0, 320);

        h.session.stop().await;
    }

    #[tokio::test]
    async fn stop_from_idle_is_a_noop() {
        let mut h = harness();
        h.session.stop().await;
        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(h.mic_releases.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn counters_reset_on_each_new_session() {
        let mut h = harness();
        h.session.start().await.expect("start");

        let tap = h.mic_taps.lock().unwrap()[0].frames.clone();
        tap.send(AudioFrame::from_samples(&vec![1; 160])).unwrap();
        wait_for(|| h.session.byte_counters().0 == 320).await;

        h.session.stop().await;
        // Totals survive the stop for the rendering layer to read.
        assert_eq!(h.session.byte_counters().0, 320);

        h.session.start().await.expect("restart");
        assert_eq!(h.session.byte_counters(), (0, 0));
        h.session.stop().await;
    }

    #[tokio::test]
    async fn frames_while_transport_down_are_dropped() {
        let mut h = harness();
        h.session.start().await.expect("start");

        let tap = h.mic_taps.lock().unwrap()[0].frames.clone();
        tap.send(AudioFrame::from_samples(&vec![1; 160])).unwrap();
        wait_for(|| h.session.byte_counters().0 == 320).await;

        // Kill the connection under the session's feet.
        h.connects.fail_sends.store(true, Ordering::Release);
        tap.send(AudioFrame::from_samples(&vec![1; 160])).unwrap();
        tap.send(AudioFrame::from_samples(&vec![1; 160])).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        // Neither frame was counted or delivered.
        assert_eq!(h.session.byte_counters().0, 320);
        assert_eq!(binary_frames(&h.wire).len(), 1);

        h.session.stop().await;
    }

    // ---- start() failures --------------------------------------------------

    #[tokio::test]
    async fn permission_denied_leaves_idle() {
        let connector = MockConnector::silent();
        let connects = Arc::new(connector);

        let (sink, _played) = MockSink::new();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let mic = MockMicrophone::failing(CaptureError::PermissionDenied("blocked".into()));

        let mut session = CaptureSession::new(
            test_config(),
            Box::new(mic),
            Arc::clone(&connects) as Arc<dyn Connector>,
            sink,
            events_tx,
        );

        let err = session.start().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Capture(CaptureError::PermissionDenied(_))
        ));
        assert_eq!(session.state(), SessionState::Idle);
        // The transport was never opened.
        assert_eq!(connects.connects.load(std::sync::atomic::Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn connect_failure_releases_microphone() {
        let mut h = harness_with(MockConnector::refusing(), test_config());

        let err = h.session.start().await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
        assert_eq!(h.session.state(), SessionState::Idle);

        // The device was acquired, then released during rollback.
        let releases = h.mic_releases.lock().unwrap();
        assert_eq!(releases.len(), 1);
        assert!(releases[0].load(Ordering::Acquire));
    }

    // ---- Inbound path ------------------------------------------------------

    #[tokio::test]
    async fn inbound_messages_reach_transcript_and_playback() {
        let payload = wav_payload(&[1000; 160], 16_000);
        let script = vec![
            Message::Text(r#"{"text":"h","final":false}"#.into()),
            Message::Text(r#"{"final":true,"text":"hi","agent":false}"#.into()),
            Message::Binary(payload.clone()),
        ];
        let mut h = harness_with(MockConnector::scripted(script), test_config());

        h.session.start().await.expect("start");

        wait_for(|| h.played.lock().unwrap().len() == 1).await;
        assert_eq!(h.played.lock().unwrap()[0].samples.len(), 160);

        {
            let transcript = h.session.transcript();
            let transcript = transcript.lock().unwrap();
            assert_eq!(transcript.entries(), &[Utterance::new(Speaker::User, "hi")]);
        }
        assert_eq!(h.session.byte_counters().1, payload.len() as u64);

        assert_eq!(
            h.events.recv().await,
            Some(ClientEvent::Partial {
                text: "h".into(),
                agent: false
            })
        );
        assert_eq!(
            h.events.recv().await,
            Some(ClientEvent::Utterance(Utterance::new(Speaker::User, "hi")))
        );

        h.session.stop().await;
    }

    #[tokio::test]
    async fn malformed_control_message_is_survivable() {
        let script = vec![
            Message::Text("{not json".into()),
            Message::Text(r#"{"final":true,"text":"ok"}"#.into()),
        ];
        let mut h = harness_with(MockConnector::scripted(script), test_config());

        h.session.start().await.expect("start");
        wait_for(|| h.session.transcript().lock().unwrap().len() == 1).await;

        let transcript = h.session.transcript();
        assert_eq!(transcript.lock().unwrap().entries()[0].text, "ok");
        h.session.stop().await;
    }

    #[tokio::test]
    async fn remote_closure_surfaces_as_event() {
        // Empty script: the inbound stream ends immediately after connect.
        let mut h = harness_with(MockConnector::scripted(Vec::new()), test_config());

        h.session.start().await.expect("start");
        assert_eq!(h.events.recv().await, Some(ClientEvent::TransportClosed));
        // The session does not tear itself down; the rendering layer reacts.
        assert_eq!(h.session.state(), SessionState::Listening);

        h.session.stop().await;
        assert_eq!(h.session.state(), SessionState::Idle);
    }

    // ---- Silence threshold -------------------------------------------------

    #[tokio::test]
    async fn threshold_adjustable_any_time() {
        let mut config = test_config();
        config.audio.silence_threshold = 0.002;
        let mut h = harness_with(MockConnector::silent(), config);

        assert!((h.session.silence_threshold() - 0.002).abs() < 1e-7);

        h.session.start().await.expect("start");
        h.session.set_silence_threshold(0.5);
        assert!((h.session.silence_threshold() - 0.01).abs() < 1e-7);

        h.session.set_silence_threshold(0.0);
        assert_eq!(h.session.silence_threshold(), 0.0);

        h.session.stop().await;
    }
}
