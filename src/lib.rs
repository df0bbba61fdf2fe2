//! Native duplex voice-chat client.
//!
//! Streams microphone audio to a remote speech-recognition service as
//! 16 kHz mono PCM over a persistent WebSocket, while receiving transcript
//! events and synthesized-speech audio on the same connection.
//!
//! # Module map
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`audio`] | Capture, resampling, playback |
//! | [`net`] | WebSocket transport and inbound dispatch |
//! | [`session`] | start/stop lifecycle, byte accounting, client events |
//! | [`transcript`] | Append-only utterance log (+ on-disk log) |
//! | [`config`] | TOML settings and platform paths |

pub mod audio;
pub mod config;
pub mod net;
pub mod session;
pub mod transcript;
