//! Exclusive-create lock records.
//!
//! A lock is a file whose existence means "held". Acquisition is a single
//! exclusive create, so two processes racing for the same name can never both
//! win. The file carries the holder's pid so an abandoned record left by a
//! crashed process can be recognised and broken.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use spoolman_core::Time;
use tracing::{debug, warn};

use crate::fsutil::{create_exclusive, put_back, remove_if_exists, set_aside};
use crate::{Result, StorageError};

/// Result of a non-blocking lock attempt.
#[derive(Debug)]
#[must_use]
pub enum LockOutcome<G> {
    /// The lock is now held through the guard
    Acquired(G),
    /// Someone else holds it; try again later
    Contended,
}

impl<G> LockOutcome<G> {
    /// Whether the lock was obtained.
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockOutcome::Acquired(_))
    }

    /// The guard, if acquired.
    pub fn into_guard(self) -> Option<G> {
        match self {
            LockOutcome::Acquired(guard) => Some(guard),
            LockOutcome::Contended => None,
        }
    }

    /// Map the guard type.
    pub fn map<H>(self, f: impl FnOnce(G) -> H) -> LockOutcome<H> {
        match self {
            LockOutcome::Acquired(guard) => LockOutcome::Acquired(f(guard)),
            LockOutcome::Contended => LockOutcome::Contended,
        }
    }
}

/// Contents of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Holder process id
    pub pid: u32,
    /// When the lock was taken
    pub acquired_at: Time,
}

impl LockRecord {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            acquired_at: chrono::Utc::now(),
        }
    }
}

/// A held lock file, removed on [`LockFile::release`] or drop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    released: bool,
}

impl LockFile {
    /// Try to take the lock at `path` without waiting.
    ///
    /// If the existing record names a process that is no longer running, the
    /// record is removed and the create retried once. Failing to remove such
    /// a record is an error, not contention.
    pub async fn try_acquire(path: impl Into<PathBuf>) -> Result<LockOutcome<LockFile>> {
        let path = path.into();
        let record = serde_json::to_vec(&LockRecord::current())?;

        if create_exclusive(&path, &record).await? {
            debug!(lock = %path.display(), "lock acquired");
            return Ok(LockOutcome::Acquired(Self { path, released: false }));
        }

        if !break_if_stale(&path).await? {
            return Ok(LockOutcome::Contended);
        }

        if create_exclusive(&path, &record).await? {
            debug!(lock = %path.display(), "lock acquired after breaking stale record");
            Ok(LockOutcome::Acquired(Self { path, released: false }))
        } else {
            Ok(LockOutcome::Contended)
        }
    }

    /// Path of the lock record.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock record.
    ///
    /// A record that has already vanished is reported as not found.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        if remove_if_exists(&self.path).await? {
            debug!(lock = %self.path.display(), "lock released");
            Ok(())
        } else {
            Err(StorageError::NotFound(self.path.display().to_string()))
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(lock = %self.path.display(), "lock released on drop"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(lock = %self.path.display(), error = %e, "failed to release lock"),
        }
    }
}

/// Read the record at `path`, `None` if missing or unreadable.
pub async fn read_record(path: &Path) -> Option<LockRecord> {
    let bytes = tokio::fs::read(path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Remove the lock at `path` if its holder is gone. Returns whether it did.
///
/// Records that cannot be parsed are treated as live: a holder may be
/// between creating the file and writing its pid.
pub async fn break_if_stale(path: &Path) -> Result<bool> {
    let Some(record) = read_record(path).await else {
        return Ok(false);
    };
    if is_pid_alive(record.pid) {
        return Ok(false);
    }
    break_record(path, &record).await
}

/// Remove the record at `path` only if it is still `stale`.
///
/// The file is first renamed aside, so of several breakers racing over the
/// same record only one ever holds it. Anything other than `stale` found
/// under the moved name is a lock taken since `stale` was read, and is put
/// back.
async fn break_record(path: &Path, stale: &LockRecord) -> Result<bool> {
    let Some(aside) = set_aside(path).await? else {
        return Ok(false);
    };
    if read_record(&aside).await.as_ref() == Some(stale) {
        warn!(lock = %path.display(), pid = stale.pid, "removing stale lock");
        remove_if_exists(&aside).await?;
        return Ok(true);
    }
    if !put_back(&aside, path).await? {
        warn!(lock = %path.display(), "lock re-taken while restoring a live record");
    }
    Ok(false)
}

/// Check whether a given PID is alive.
pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    if pid == std::process::id() {
        return true;
    }
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    #[cfg(unix)]
    {
        // SAFETY: signal 0 performs only the existence and permission check.
        let result = unsafe { libc::kill(pid, 0) };
        if result == 0 {
            return true;
        }
        // EPERM: the process exists but belongs to someone else.
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_attempt_is_contended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("LXQ.0");
        let held = LockFile::try_acquire(&path).await.unwrap().into_guard().unwrap();
        assert!(!LockFile::try_acquire(&path).await.unwrap().is_acquired());
        held.release().await.unwrap();
        assert!(LockFile::try_acquire(&path).await.unwrap().is_acquired());
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("LXQ.0");
        {
            let _held = LockFile::try_acquire(&path).await.unwrap().into_guard().unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_stale_record_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("LCK..hub");
        let stale = LockRecord {
            pid: i32::MAX as u32,
            acquired_at: chrono::Utc::now(),
        };
        tokio::fs::write(&path, serde_json::to_vec(&stale).unwrap()).await.unwrap();

        let held = LockFile::try_acquire(&path).await.unwrap().into_guard().unwrap();
        let record = read_record(held.path()).await.unwrap();
        assert_eq!(record.pid, std::process::id());
    }

    #[tokio::test]
    async fn test_unreadable_record_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("LCK..hub");
        tokio::fs::write(&path, b"").await.unwrap();
        assert!(!LockFile::try_acquire(&path).await.unwrap().is_acquired());
    }

    #[tokio::test]
    async fn test_release_of_vanished_record_reports() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("LXQ.dir");
        let held = LockFile::try_acquire(&path).await.unwrap().into_guard().unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(held.release().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_breaking_spares_a_lock_taken_since() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("LXF.hub.D.hubA0001");
        let stale = LockRecord {
            pid: i32::MAX as u32,
            acquired_at: chrono::Utc::now(),
        };
        let live = LockRecord::current();
        tokio::fs::write(&path, serde_json::to_vec(&live).unwrap()).await.unwrap();

        assert!(!break_record(&path, &stale).await.unwrap());
        assert_eq!(read_record(&path).await, Some(live));
        assert_eq!(crate::fsutil::list_names(dir.path()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_racing_breakers_leave_one_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("LCK..hub");
        let stale = LockRecord {
            pid: i32::MAX as u32,
            acquired_at: chrono::Utc::now(),
        };
        tokio::fs::write(&path, serde_json::to_vec(&stale).unwrap()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let path = path.clone();
            handles.push(tokio::spawn(async move { LockFile::try_acquire(path).await.unwrap() }));
        }
        let mut held = Vec::new();
        for handle in handles {
            if let Some(guard) = handle.await.unwrap().into_guard() {
                held.push(guard);
            }
        }
        assert_eq!(held.len(), 1);
        assert_eq!(read_record(&path).await.unwrap().pid, std::process::id());
    }
}
