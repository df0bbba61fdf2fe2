//! Session state machine primitives and shared observability state.
//!
//! [`SessionState`] is the two-state lifecycle of the capture session.  The
//! rendering layer reads it via [`crate::session::CaptureSession::state`],
//! together with [`ByteCounters`] and the transcript.
//!
//! [`ClientEvent`] is the event stream delivered to the rendering layer —
//! cheap to clone, sent over an unbounded channel.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::transcript::Utterance;

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// States of the capture session.
///
/// The state machine transitions are:
///
/// ```text
/// Idle ──start()──▶ Listening
/// Listening ──stop()──▶ Idle
/// ```
///
/// `start()` while `Listening` and `stop()` while `Idle` are no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No microphone, no connection.  Initial and terminal state.
    Idle,
    /// Microphone open, transport connected, frames streaming.
    Listening,
}

impl SessionState {
    /// A short human-readable label suitable for a status line.
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Listening => "Listening",
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Idle
    }
}

// ---------------------------------------------------------------------------
// ByteCounters
// ---------------------------------------------------------------------------

/// Running totals of payload bytes crossing the wire.
///
/// Monotonically non-decreasing while `Listening`; reset to zero on every
/// transition into `Listening`.  `sent` counts outbound PCM payload bytes
/// that were actually handed to an open transport; `received` counts
/// inbound binary payload bytes.
#[derive(Debug, Default)]
pub struct ByteCounters {
    sent: AtomicU64,
    received: AtomicU64,
}

impl ByteCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero both counters.
    pub fn reset(&self) {
        self.sent.store(0, Ordering::Release);
        self.received.store(0, Ordering::Release);
    }

    pub fn add_sent(&self, bytes: u64) {
        self.sent.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn add_received(&self, bytes: u64) {
        self.received.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Acquire)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }

    /// `(sent, received)` in one read.
    pub fn snapshot(&self) -> (u64, u64) {
        (self.sent(), self.received())
    }
}

// ---------------------------------------------------------------------------
// ClientEvent
// ---------------------------------------------------------------------------

/// Events delivered to the rendering layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A finalized utterance was appended to the transcript.
    Utterance(Utterance),
    /// A transient (non-final) recognition update.  Never stored; display
    /// is up to the rendering layer.
    Partial { text: String, agent: bool },
    /// The transport closed — remotely, on error, or because the session
    /// stopped.  No reconnection is attempted.
    TransportClosed,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_is_idle() {
        assert_eq!(SessionState::default(), SessionState::Idle);
    }

    #[test]
    fn labels() {
        assert_eq!(SessionState::Idle.label(), "Idle");
        assert_eq!(SessionState::Listening.label(), "Listening");
    }

    #[test]
    fn counters_accumulate() {
        let c = ByteCounters::new();
        c.add_sent(320);
        c.add_sent(320);
        c.add_received(100);
        assert_eq!(c.snapshot(), (640, 100));
    }

    #[test]
    fn reset_zeroes_both() {
        let c = ByteCounters::new();
        c.add_sent(1);
        c.add_received(2);
        c.reset();
        assert_eq!(c.snapshot(), (0, 0));
    }

    #[test]
    fn counters_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ByteCounters>();
    }
}
