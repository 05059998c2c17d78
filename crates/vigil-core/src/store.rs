//! On-disk state shared between the orchestrator, the watchdog, and
//! external verification tooling.
//!
//! Layout under the data root:
//!
//! ```text
//! snapshots/<source>/snapshot_<ts>.json   immutable capture files
//! ledger/record_<seq>.json                chained hash records
//! failed_requests.jsonl                   durable failure log
//! heartbeat.json                          overwritten each completed cycle
//! locks/*.lock                            presence-based lock files
//! watchdog_state.json                     supervisor state
//! breaker_state.json                      circuit breaker checkpoint
//! ```
//!
//! Every file that crosses a process boundary is written atomically
//! (write-temp, fsync, rename) so a concurrent reader never observes a
//! partial document.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem operation failed.
    #[error("store I/O error at {path}: {source}")]
    Io {
        /// Path involved in the failed operation.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// JSON encoding or decoding failed.
    #[error("store serialization error at {path}: {source}")]
    Serde {
        /// Path involved in the failed operation.
        path: PathBuf,
        /// Underlying serde error.
        source: serde_json::Error,
    },

    /// Attempted to overwrite an immutable file.
    #[error("refusing to overwrite immutable file {path}")]
    Immutable {
        /// Path of the existing file.
        path: PathBuf,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Paths of the shared on-disk state, rooted at the data directory.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Create a layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The data root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of immutable snapshot files.
    #[must_use]
    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    /// Directory of chained hash records.
    #[must_use]
    pub fn ledger_dir(&self) -> PathBuf {
        self.root.join("ledger")
    }

    /// Newline-delimited failure log.
    #[must_use]
    pub fn failed_requests_path(&self) -> PathBuf {
        self.root.join("failed_requests.jsonl")
    }

    /// Heartbeat file overwritten after each completed cycle.
    #[must_use]
    pub fn heartbeat_path(&self) -> PathBuf {
        self.root.join("heartbeat.json")
    }

    /// Directory of presence-based lock files.
    #[must_use]
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Lock serializing acquisition cycles (single logical writer).
    #[must_use]
    pub fn cycle_lock_path(&self) -> PathBuf {
        self.locks_dir().join("cycle.lock")
    }

    /// Lock serializing ledger appends.
    #[must_use]
    pub fn ledger_lock_path(&self) -> PathBuf {
        self.locks_dir().join("ledger.lock")
    }

    /// Persisted watchdog state.
    #[must_use]
    pub fn watchdog_state_path(&self) -> PathBuf {
        self.root.join("watchdog_state.json")
    }

    /// Circuit breaker checkpoint.
    #[must_use]
    pub fn breaker_state_path(&self) -> PathBuf {
        self.root.join("breaker_state.json")
    }
}

/// Write `bytes` to `path` atomically: temp file in the same directory,
/// fsync, then rename over the target.
///
/// # Errors
///
/// Returns `StoreError::Io` on filesystem errors.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::io(path, e))?;
    }
    let dir = parent.unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StoreError::io(path, e))?;
    temp.write_all(bytes).map_err(|e| StoreError::io(path, e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(path, e))?;
    temp.persist(path)
        .map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
///
/// # Errors
///
/// Returns `StoreError` on serialization or filesystem errors.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let payload = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serde {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &payload)
}

/// Load a JSON document, returning `None` when the file does not exist.
///
/// # Errors
///
/// Returns `StoreError` when the file exists but cannot be read or parsed.
pub fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, StoreError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StoreError::io(path, err)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| StoreError::Serde {
            path: path.to_path_buf(),
            source,
        })
}

/// One immutable capture of source payload plus capture metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Identifier of the source this capture came from.
    pub source_id: String,

    /// URL the payload was fetched from.
    pub source_url: String,

    /// Capture time.
    pub captured_at_utc: DateTime<Utc>,

    /// Version of the software that produced the capture.
    pub software_version: String,

    /// Verbatim payload text as returned by the source.
    pub payload: String,
}

/// Append-only store of immutable snapshot files, one file per capture.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    /// Create a store rooted at the snapshots directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn source_dir(&self, source_id: &str) -> PathBuf {
        self.root.join(source_id)
    }

    /// Persist a snapshot as a new immutable file and return its path.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Immutable`] if a file for the same capture
    /// instant already exists; snapshots are never overwritten.
    pub fn persist(&self, snapshot: &Snapshot) -> Result<PathBuf, StoreError> {
        let name = format!(
            "snapshot_{}.json",
            snapshot.captured_at_utc.format("%Y-%m-%d_%H-%M-%S_%3f")
        );
        let path = self.source_dir(&snapshot.source_id).join(name);
        if path.exists() {
            return Err(StoreError::Immutable { path });
        }
        write_json_atomic(&path, snapshot)?;
        Ok(path)
    }

    /// Load a snapshot file.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` when the file is missing or unreadable.
    pub fn load(path: &Path) -> Result<Snapshot, StoreError> {
        read_json(path)?.ok_or_else(|| {
            StoreError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "snapshot missing"),
            )
        })
    }

    /// Age of the newest snapshot for a source, from file mtime.
    ///
    /// Returns `None` when the source has no snapshots yet. Used for the
    /// idempotency window: a repeated capture inside the window is skipped.
    #[must_use]
    pub fn newest_age(&self, source_id: &str) -> Option<Duration> {
        newest_file_age(&self.source_dir(source_id))
    }

    /// Age of the newest snapshot across all sources.
    ///
    /// The watchdog uses this for its staleness check.
    #[must_use]
    pub fn newest_age_any(&self) -> Option<Duration> {
        newest_file_age_recursive(&self.root)
    }
}

fn newest_file_age(dir: &Path) -> Option<Duration> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| entry.metadata().ok()?.modified().ok())
        .filter_map(|modified| modified.elapsed().ok())
        .min()
}

fn newest_file_age_recursive(dir: &Path) -> Option<Duration> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut newest: Option<Duration> = None;
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        let age = if path.is_dir() {
            newest_file_age_recursive(&path)
        } else {
            entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|m| m.elapsed().ok())
        };
        newest = match (newest, age) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
    newest
}

/// One entry in the durable failure log, appended per terminally failed
/// attempt sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,

    /// URL of the failed request.
    pub url: String,

    /// HTTP method used.
    pub method: String,

    /// Number of attempts made before giving up.
    pub attempts: u32,

    /// Final HTTP status, if the failure was status-classified.
    pub status_code: Option<u16>,

    /// Human-readable failure description.
    pub error: String,

    /// Truncated response body, when one was received.
    pub response_text: Option<String>,
}

/// Newline-delimited durable failure log.
#[derive(Debug, Clone)]
pub struct FailureLog {
    path: PathBuf,
}

impl FailureLog {
    /// Create a log writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a JSON line.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on serialization or filesystem errors.
    pub fn append(&self, record: &FailureRecord) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(&self.path, e))?;
        }
        let mut line = serde_json::to_vec(record).map_err(|source| StoreError::Serde {
            path: self.path.clone(),
            source,
        })?;
        line.push(b'\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.write_all(&line)
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.sync_all().map_err(|e| StoreError::io(&self.path, e))?;
        Ok(())
    }
}

/// Liveness heartbeat written by the orchestrator after each completed
/// cycle and read by the watchdog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    /// When the heartbeat was written.
    pub written_at_utc: DateTime<Utc>,

    /// PID of the writing process.
    pub pid: u32,

    /// Outcome label of the last cycle.
    pub last_outcome: String,

    /// Operating mode after the last cycle.
    pub mode: String,
}

/// Overwrite the heartbeat file atomically.
///
/// # Errors
///
/// Returns `StoreError` on serialization or filesystem errors.
pub fn write_heartbeat(path: &Path, heartbeat: &Heartbeat) -> Result<(), StoreError> {
    write_json_atomic(path, heartbeat)
}

/// Read the heartbeat file, returning `None` when absent.
///
/// # Errors
///
/// Returns `StoreError` when the file exists but cannot be parsed; the
/// watchdog treats that as a failed liveness check.
pub fn read_heartbeat(path: &Path) -> Result<Option<Heartbeat>, StoreError> {
    read_json(path)
}
