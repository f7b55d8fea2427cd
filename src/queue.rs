//! Durable queue of transition events.
//!
//! Events stay pending until acknowledged, so a worker that dies mid-job
//! sees the same event again after restart.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::EncryptionType;

/// Request to move every record of one config to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub id: String,
    pub account_id: String,
    pub from_config_id: String,
    pub from_type: EncryptionType,
    pub to_config_id: String,
    pub to_type: EncryptionType,
    pub enqueued_at: DateTime<Utc>,
}

pub trait TransitionQueue: Send + Sync {
    fn push(&self, event: TransitionEvent) -> Result<()>;

    /// Unacknowledged events, oldest first.
    fn pending(&self) -> Result<Vec<TransitionEvent>>;

    /// Returns `false` if the event was not pending.
    fn ack(&self, event_id: &str) -> Result<bool>;
}

#[derive(Default)]
pub struct InMemoryTransitionQueue {
    events: Mutex<Vec<TransitionEvent>>,
}

impl InMemoryTransitionQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransitionQueue for InMemoryTransitionQueue {
    fn push(&self, event: TransitionEvent) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }

    fn pending(&self) -> Result<Vec<TransitionEvent>> {
        Ok(self.events.lock().clone())
    }

    fn ack(&self, event_id: &str) -> Result<bool> {
        let mut events = self.events.lock();
        let before = events.len();
        events.retain(|e| e.id != event_id);
        Ok(events.len() != before)
    }
}

// ---------------------------------------------------------------------------
// File journal
// ---------------------------------------------------------------------------

/// Journal length, in lines, past which an ack rewrites the journal down to
/// the pending pushes.
const COMPACT_AFTER_LINES: usize = 256;

#[derive(Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalEntry {
    Push { event: TransitionEvent },
    Ack { event_id: String },
}

struct Journal {
    file: File,
    lines: usize,
    pending: Vec<TransitionEvent>,
}

/// Queue backed by an append-only JSON-lines journal of pushes and acks.
///
/// Opening an existing journal replays it and rewrites it to the pending
/// pushes, which also drops a line torn by a crash mid-write. The journal is
/// rewritten the same way once acknowledged entries dominate it.
pub struct FileTransitionQueue {
    path: PathBuf,
    journal: Mutex<Journal>,
}

impl FileTransitionQueue {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut pending: Vec<TransitionEvent> = Vec::new();
        if path.exists() {
            let contents = fs::read(&path)?;
            for (lineno, line) in contents.split(|b| *b == b'\n').enumerate() {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match serde_json::from_slice::<JournalEntry>(line) {
                    Ok(JournalEntry::Push { event }) => pending.push(event),
                    Ok(JournalEntry::Ack { event_id }) => pending.retain(|e| e.id != event_id),
                    Err(e) => warn!(
                        path = %path.display(),
                        line = lineno + 1,
                        error = %e,
                        "skipping unreadable journal line"
                    ),
                }
            }
        }
        let file = Self::rewrite(&path, &pending)?;
        Ok(Self {
            path,
            journal: Mutex::new(Journal {
                file,
                lines: pending.len(),
                pending,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(file: &mut File, entry: &JournalEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{line}")?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    /// Replace the journal with one push per pending event and return it
    /// opened for appending.
    fn rewrite(path: &Path, pending: &[TransitionEvent]) -> Result<File> {
        let staging = path.with_extension("compacting");
        {
            let mut file = File::create(&staging)?;
            for event in pending {
                let line = serde_json::to_string(&JournalEntry::Push { event: event.clone() })?;
                writeln!(file, "{line}")?;
            }
            file.sync_all()?;
        }
        fs::rename(&staging, path)?;
        Ok(OpenOptions::new().append(true).open(path)?)
    }
}

impl TransitionQueue for FileTransitionQueue {
    fn push(&self, event: TransitionEvent) -> Result<()> {
        let mut journal = self.journal.lock();
        Self::append(&mut journal.file, &JournalEntry::Push { event: event.clone() })?;
        journal.lines += 1;
        journal.pending.push(event);
        Ok(())
    }

    fn pending(&self) -> Result<Vec<TransitionEvent>> {
        Ok(self.journal.lock().pending.clone())
    }

    fn ack(&self, event_id: &str) -> Result<bool> {
        let mut journal = self.journal.lock();
        if !journal.pending.iter().any(|e| e.id == event_id) {
            return Ok(false);
        }
        Self::append(
            &mut journal.file,
            &JournalEntry::Ack {
                event_id: event_id.to_string(),
            },
        )?;
        journal.lines += 1;
        journal.pending.retain(|e| e.id != event_id);

        if journal.lines >= COMPACT_AFTER_LINES && journal.lines > 2 * journal.pending.len() {
            journal.file = Self::rewrite(&self.path, &journal.pending)?;
            journal.lines = journal.pending.len();
            debug!(
                path = %self.path.display(),
                pending = journal.lines,
                "compacted transition journal"
            );
        }
        Ok(true)
    }
}
