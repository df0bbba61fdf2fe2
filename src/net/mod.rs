//! Duplex wire protocol — transport and inbound dispatch.
//!
//! ```text
//! AudioFrame (channel) ──▶ writer task ──▶ WebSocket ──▶ remote recognizer
//!                                            │
//!                      reader task ◀─────────┘
//!                           │
//!                           ▼
//!                     WireMessage (channel)
//!                           │
//!                           ▼
//!                      Dispatcher ──▶ { PlaybackScheduler | TranscriptModel }
//! ```
//!
//! Messages are classified purely by the transport envelope: binary frames
//! are synthesized audio, text frames are JSON control events.

pub mod dispatcher;
pub mod transport;

pub use dispatcher::{ControlEvent, Dispatcher};
pub use transport::{Connector, Transport, TransportError, TransportLink, WireMessage, WsConnector};
