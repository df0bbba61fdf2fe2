//! Inbound message dispatch.
//!
//! One [`Dispatcher`] runs per listening session, consuming the transport's
//! inbound stream message by message:
//!
//! * binary payload → byte accounting, then queued for playback;
//! * text payload → parsed as a JSON [`ControlEvent`]; only `final` events
//!   become transcript entries, with the speaker taken from the `agent`
//!   flag.
//!
//! A text frame that fails to parse is logged and discarded; the session
//! continues.  When the inbound stream ends the dispatcher emits
//! [`ClientEvent::TransportClosed`] and returns.

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;

use crate::session::{ByteCounters, ClientEvent};
use crate::transcript::{SharedTranscript, Speaker, TranscriptLog, Utterance};

use super::WireMessage;

// ---------------------------------------------------------------------------
// ControlEvent
// ---------------------------------------------------------------------------

/// A decoded text frame: `{ "final": bool, "text": string, "agent"?: bool }`.
///
/// Unknown fields are ignored; every field defaults when absent, matching
/// the wire contract where a missing `agent` means the user spoke.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ControlEvent {
    #[serde(rename = "final", default)]
    pub is_final: bool,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub agent: bool,
}

impl ControlEvent {
    /// Which speaker this event is attributed to.
    pub fn speaker(&self) -> Speaker {
        if self.agent {
            Speaker::Agent
        } else {
            Speaker::User
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Routes each inbound message to the playback queue or the transcript.
pub struct Dispatcher {
    transcript: SharedTranscript,
    counters: Arc<ByteCounters>,
    playback: mpsc::UnboundedSender<Vec<u8>>,
    events: mpsc::UnboundedSender<ClientEvent>,
    log: Option<TranscriptLog>,
}

impl Dispatcher {
    pub fn new(
        transcript: SharedTranscript,
        counters: Arc<ByteCounters>,
        playback: mpsc::UnboundedSender<Vec<u8>>,
        events: mpsc::UnboundedSender<ClientEvent>,
        log: Option<TranscriptLog>,
    ) -> Self {
        Self {
            transcript,
            counters,
            playback,
            events,
            log,
        }
    }

    /// Consume `inbound` until it closes, then report the closure.
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<WireMessage>) {
        while let Some(message) = inbound.recv().await {
            self.dispatch(message);
        }
        let _ = self.events.send(ClientEvent::TransportClosed);
        log::debug!("dispatcher finished");
    }

    /// Handle exactly one inbound message.
    fn dispatch(&mut self, message: WireMessage) {
        match message {
            WireMessage::Binary(payload) => {
                self.counters.add_received(payload.len() as u64);
                // Send errors mean the playback worker is gone; the payload
                // is dropped, capture is unaffected.
                let _ = self.playback.send(payload);
            }
            WireMessage::Text(raw) => match serde_json::from_str::<ControlEvent>(&raw) {
                Ok(event) => self.handle_control(event),
                Err(e) => log::warn!("discarding malformed control message: {e}"),
            },
        }
    }

    fn handle_control(&mut self, event: ControlEvent) {
        if !event.is_final {
            let _ = self.events.send(ClientEvent::Partial {
                text: event.text,
                agent: event.agent,
            });
            return;
        }

        let utterance = Utterance::new(event.speaker(), event.text);

        if let Some(log) = &mut self.log {
            log.record(&utterance);
        }
        self.transcript.lock().unwrap().append(utterance.clone());
        let _ = self.events.send(ClientEvent::Utterance(utterance));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
