//! On-disk transcript log.
//!
//! Appends one timestamped line per finalized utterance:
//!
//! ```text
//! 2026-08-06 10:12:03.481 < what time is it
//! 2026-08-06 10:12:04.017 > IT IS TEN PAST TEN
//! ```
//!
//! `<` marks the user, `>` marks the agent.  Write failures are logged and
//! otherwise ignored; the log is an observability aid, not session state.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use super::{Speaker, Utterance};

/// Append-only transcript log file.
pub struct TranscriptLog {
    file: File,
}

impl TranscriptLog {
    /// Open (or create) the log at `path` in append mode, creating parent
    /// directories as needed.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    /// Append one line for `utterance`.
    pub fn record(&mut self, utterance: &Utterance) {
        let direction = match utterance.speaker {
            Speaker::User => '<',
            Speaker::Agent => '>',
        };
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");

        if let Err(e) = writeln!(self.file, "{stamp} {direction} {}", utterance.text) {
            log::warn!("transcript log write failed: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
