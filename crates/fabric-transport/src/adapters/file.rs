//! File-backed event log.
//!
//! Single-writer durability for one node: records are JSON lines appended
//! to `events.log` and fsynced per batch, group cursors live in
//! `cursors.json` (written via temp-file rename), and an `fs2` exclusive
//! lock on `writer.lock` keeps a second process from appending to the same
//! directory.
//!
//! On open the log is replayed into a memory mirror; a partial trailing
//! line (torn write from a crash) is dropped with a warning, while
//! corruption anywhere else is surfaced as an error.

use crate::domain::errors::StoreError;
use crate::ports::outbound::{EventLog, LogEntry, SequencedEntry};
use async_trait::async_trait;
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LOG_FILE: &str = "events.log";
const CURSOR_FILE: &str = "cursors.json";
const LOCK_FILE: &str = "writer.lock";

struct FileState {
    writer: File,
    entries: Vec<LogEntry>,
    cursors: HashMap<String, u64>,
}

/// Durable single-node [`EventLog`] over a log directory.
pub struct FileEventLog {
    dir: PathBuf,
    state: Mutex<FileState>,
    // Held for the lifetime of the instance; releasing it (on drop) lets
    // the next writer take the directory.
    _lock: File,
}

impl FileEventLog {
    /// Open (or create) a log directory, replaying existing records.
    ///
    /// # Errors
    ///
    /// - `StoreError::Locked` when another writer holds the directory
    /// - `StoreError::Io` on filesystem failures
    /// - `StoreError::Corrupt` for mid-file record corruption
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(io_error)?;

        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(LOCK_FILE))
            .map_err(io_error)?;
        lock.try_lock_exclusive().map_err(|_| StoreError::Locked)?;

        let entries = Self::replay(&dir.join(LOG_FILE))?;
        let cursors = Self::load_cursors(&dir.join(CURSOR_FILE));

        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE))
            .map_err(io_error)?;

        debug!(
            dir = %dir.display(),
            entries = entries.len(),
            groups = cursors.len(),
            "File event log opened"
        );

        Ok(Self {
            dir,
            state: Mutex::new(FileState {
                writer,
                entries,
                cursors,
            }),
            _lock: lock,
        })
    }

    /// The directory this log writes to.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn replay(path: &Path) -> Result<Vec<LogEntry>, StoreError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(error) => return Err(io_error(error)),
        };

        let lines: Vec<String> = BufReader::new(file)
            .lines()
            .collect::<Result<_, _>>()
            .map_err(io_error)?;

        let mut entries = Vec::with_capacity(lines.len());
        let last = lines.len().saturating_sub(1);
        for (index, line) in lines.iter().enumerate() {
            match serde_json::from_str::<LogEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(error) if index == last => {
                    // Torn tail from a crash mid-append: drop it. The
                    // publisher never saw an acceptance for this record.
                    warn!(offset = index, error = %error, "Dropping torn trailing log record");
                    break;
                }
                Err(error) => {
                    return Err(StoreError::Corrupt {
                        offset: index as u64,
                        reason: error.to_string(),
                    });
                }
            }
        }
        Ok(entries)
    }

    fn load_cursors(path: &Path) -> HashMap<String, u64> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|error| {
                // Losing cursors only widens redelivery, which
                // at-least-once consumers already tolerate.
                warn!(error = %error, "Cursor file unreadable; groups restart from zero");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        }
    }

    fn persist_cursors(&self, cursors: &HashMap<String, u64>) -> Result<(), StoreError> {
        let tmp = self.dir.join(format!("{CURSOR_FILE}.tmp"));
        let bytes = serde_json::to_vec(cursors).map_err(|e| StoreError::Io {
            reason: e.to_string(),
        })?;
        std::fs::write(&tmp, bytes).map_err(io_error)?;
        std::fs::rename(&tmp, self.dir.join(CURSOR_FILE)).map_err(io_error)?;
        Ok(())
    }
}

fn io_error(error: std::io::Error) -> StoreError {
    StoreError::Io {
        reason: error.to_string(),
    }
}

#[async_trait]
impl EventLog for FileEventLog {
    async fn append_batch(&self, entries: Vec<LogEntry>) -> Result<u64, StoreError> {
        let mut state = self.state.lock();
        let first = state.entries.len() as u64;

        let mut buffer = String::new();
        for entry in &entries {
            let line = serde_json::to_string(entry).map_err(|e| StoreError::Io {
                reason: e.to_string(),
            })?;
            buffer.push_str(&line);
            buffer.push('\n');
        }
        state.writer.write_all(buffer.as_bytes()).map_err(io_error)?;
        state.writer.sync_data().map_err(io_error)?;

        state.entries.extend(entries);
        Ok(first)
    }

    async fn read_from(&self, offset: u64, max: usize) -> Result<Vec<SequencedEntry>, StoreError> {
        let state = self.state.lock();
        let start = offset.min(state.entries.len() as u64) as usize;
        Ok(state.entries[start..]
            .iter()
            .take(max)
            .enumerate()
            .map(|(i, entry)| SequencedEntry {
                offset: (start + i) as u64,
                entry: entry.clone(),
            })
            .collect())
    }

    async fn next_offset(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().entries.len() as u64)
    }

    async fn load_cursor(&self, group: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.state.lock().cursors.get(group).copied())
    }

    async fn store_cursor(&self, group: &str, offset: u64) -> Result<(), StoreError> {
        let cursors = {
            let mut state = self.state.lock();
            state.cursors.insert(group.to_string(), offset);
            state.cursors.clone()
        };
        self.persist_cursors(&cursors)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        if self.dir.exists() {
            Ok(())
        } else {
            Err(StoreError::Unavailable {
                reason: "log directory missing".to_string(),
            })
        }
    }
}
