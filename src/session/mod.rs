//! Capture session lifecycle and shared client state.
//!
//! # Architecture
//!
//! ```text
//! rendering layer ──start()/stop()──▶ CaptureSession
//!                                        │
//!            ┌───────────────────────────┼──────────────────────┐
//!            ▼                           ▼                      ▼
//!      Microphone (cpal)          Transport (WebSocket)   PlaybackScheduler
//!            │                           │
//!            └──AudioFrame──▶ writer ────┘
//!                                        │
//!                             Dispatcher ┴─▶ TranscriptModel, ClientEvent
//! ```
//!
//! The rendering layer observes the session through [`SessionState`],
//! [`ByteCounters`] totals, the shared transcript, and the [`ClientEvent`]
//! channel.

pub mod runner;
pub mod state;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use runner::{CaptureSession, SessionError};
pub use state::{ByteCounters, ClientEvent, SessionState};
