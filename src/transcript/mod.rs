//! Conversation transcript — an append-only, speaker-tagged log of
//! finalized utterances.
//!
//! Only the inbound dispatcher writes to the model; the rendering layer
//! reads it through [`SharedTranscript`].  Entries are kept in arrival
//! order and never reordered, merged, or mutated after append.

pub mod log;

pub use log::TranscriptLog;

use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Speaker / Utterance
// ---------------------------------------------------------------------------

/// Who produced an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    /// The person at the microphone.
    User,
    /// The remote synthesized agent.
    Agent,
}

impl Speaker {
    /// Short label for console rendering.
    pub fn label(&self) -> &'static str {
        match self {
            Speaker::User => "you",
            Speaker::Agent => "agent",
        }
    }
}

/// One finalized utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub speaker: Speaker,
    pub text: String,
}

impl Utterance {
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// TranscriptModel
// ---------------------------------------------------------------------------

/// Append-only sequence of finalized utterances.
#[derive(Debug, Default)]
pub struct TranscriptModel {
    entries: Vec<Utterance>,
}

impl TranscriptModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an utterance.  Arrival order is the only order.
    pub fn append(&mut self, utterance: Utterance) {
        self.entries.push(utterance);
    }

    /// All utterances, oldest first.
    pub fn entries(&self) -> &[Utterance] {
        &self.entries
    }

    /// The most recent utterance, if any.
    pub fn last(&self) -> Option<&Utterance> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Thread-safe handle to the transcript.  Lock briefly; never hold the
/// guard across an `.await`.
pub type SharedTranscript = Arc<Mutex<TranscriptModel>>;

/// Construct an empty [`SharedTranscript`].
pub fn new_shared_transcript() -> SharedTranscript {
    Arc::new(Mutex::new(TranscriptModel::new()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
