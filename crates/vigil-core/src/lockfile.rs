//! Exclusive file locks for single-writer coordination.
//!
//! Ledger appends and the acquisition cycle are guarded by `flock(LOCK_EX)`
//! style locks held through an RAII guard. The lock is released by the OS
//! when the file descriptor closes, so a crashed holder never wedges the
//! system; the watchdog separately flags lock files whose mtime is stale.
//!
//! # Synchronization Protocol
//!
//! - Writer acquires the exclusive lock, performs its atomic writes, drops
//!   the guard.
//! - Lock release synchronizes-with the next successful acquisition.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use thiserror::Error;

/// Poll interval while waiting for a contended lock.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Maximum jitter added to the poll interval (milliseconds).
const LOCK_POLL_JITTER_MS: u64 = 50;

/// Errors from lock acquisition.
#[derive(Debug, Error)]
pub enum LockError {
    /// Lock file could not be opened.
    #[error("failed to open lock file {path}: {source}")]
    Open {
        /// Path of the lock file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Lock acquisition timed out.
    #[error("lock acquisition timed out for {path} after {elapsed_secs}s")]
    Timeout {
        /// Path of the lock file.
        path: PathBuf,
        /// Seconds waited before giving up.
        elapsed_secs: u64,
    },

    /// Lock acquisition failed with an unexpected error.
    #[error("lock acquisition failed for {path}: {source}")]
    Acquire {
        /// Path of the lock file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// RAII guard for an exclusively-held lock file.
///
/// The lock is released when this guard is dropped; the underlying file
/// lock is released by the OS when the descriptor closes.
pub struct LockGuard {
    _file: File,
    path: PathBuf,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    /// Path of the held lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Try to acquire an exclusive lock (non-blocking).
///
/// Returns `Ok(None)` when the lock is currently held elsewhere.
///
/// # Errors
///
/// Returns `LockError` on unexpected filesystem errors.
pub fn try_lock(path: &Path) -> Result<Option<LockGuard>, LockError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| LockError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        }
    }

    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|source| LockError::Open {
            path: path.to_path_buf(),
            source,
        })?;

    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(LockGuard {
            _file: file,
            path: path.to_path_buf(),
        })),
        Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
        Err(source) => Err(LockError::Acquire {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Acquire an exclusive lock, polling with jitter until success or timeout.
///
/// # Errors
///
/// Returns [`LockError::Timeout`] if the lock is not acquired within
/// `timeout`.
pub fn acquire_lock(path: &Path, timeout: Duration) -> Result<LockGuard, LockError> {
    let start = Instant::now();
    loop {
        if let Some(guard) = try_lock(path)? {
            return Ok(guard);
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(LockError::Timeout {
                path: path.to_path_buf(),
                elapsed_secs: elapsed.as_secs(),
            });
        }
        let jitter_ms = rand::random::<u64>() % (LOCK_POLL_JITTER_MS + 1);
        std::thread::sleep(LOCK_POLL_INTERVAL + Duration::from_millis(jitter_ms));
    }
}

/// Age of a lock file's last modification, if the file exists.
///
/// The watchdog uses this presence/age probe to detect deadlocked holders.
#[must_use]
pub fn lock_age(path: &Path) -> Option<Duration> {
    let metadata = std::fs::metadata(path).ok()?;
    let modified = metadata.modified().ok()?;
    modified.elapsed().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_lock_blocks_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");

        let guard = try_lock(&path).unwrap().expect("first lock acquired");
        assert!(try_lock(&path).unwrap().is_none(), "second lock must fail");

        drop(guard);
        assert!(try_lock(&path).unwrap().is_some(), "lock released on drop");
    }

    #[test]
    fn acquire_times_out_when_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("held.lock");

        let _guard = try_lock(&path).unwrap().unwrap();
        let result = acquire_lock(&path, Duration::from_millis(250));
        assert!(matches!(result, Err(LockError::Timeout { .. })));
    }

    #[test]
    fn lock_age_reports_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aged.lock");
        assert!(lock_age(&path).is_none());

        std::fs::write(&path, b"").unwrap();
        assert!(lock_age(&path).is_some());
    }
}
