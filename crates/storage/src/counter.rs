//! Persisted monotonically increasing counters.
//!
//! Read-increment-write of a counter file is the one short critical section
//! in the spool that waits for its lock: it never spans more than a few
//! filesystem calls, so a bounded wait is preferred over failing a
//! submission.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::fs;
use tracing::warn;

use crate::fsutil::{create_exclusive, put_back, remove_if_exists, set_aside, write_atomic};
use crate::{Result, StorageError};

const LOCK_ATTEMPTS: u32 = 200;
const LOCK_PAUSE: Duration = Duration::from_millis(10);

/// A counter stored as decimal text in a file.
#[derive(Debug, Clone)]
pub struct PersistentCounter {
    path: PathBuf,
    lock: PathBuf,
    stale_after: Duration,
}

impl PersistentCounter {
    /// Counter stored at `path`, guarded by `<path>.LCK`.
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration) -> Self {
        let path = path.into();
        let mut lock = path.clone().into_os_string();
        lock.push(".LCK");
        Self {
            path,
            lock: lock.into(),
            stale_after,
        }
    }

    /// Reserve `count` consecutive values, returning the first.
    ///
    /// The new high-water mark is on disk before this returns, so reserved
    /// values are never handed out again, even after a restart.
    pub async fn reserve(&self, count: u64) -> Result<u64> {
        self.lock().await?;
        let result = async {
            let current = self.current().await?;
            let next = current.wrapping_add(count);
            write_atomic(&self.path, next.to_string().as_bytes()).await?;
            Ok(current)
        }
        .await;
        if let Err(e) = remove_if_exists(&self.lock).await {
            warn!(lock = %self.lock.display(), error = %e, "failed to release counter lock");
        }
        result
    }

    /// Next value that would be reserved.
    pub async fn current(&self) -> Result<u64> {
        match fs::read_to_string(&self.path).await {
            Ok(text) => text.trim().parse().map_err(|_| {
                StorageError::corrupt("-", self.path.display(), format!("counter holds {text:?}"))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn lock(&self) -> Result<()> {
        for _ in 0..LOCK_ATTEMPTS {
            if create_exclusive(&self.lock, std::process::id().to_string().as_bytes()).await? {
                return Ok(());
            }
            if is_stale(&self.lock, self.stale_after).await && self.break_lock().await? {
                continue;
            }
            tokio::time::sleep(LOCK_PAUSE).await;
        }
        Err(StorageError::Busy(self.lock.clone()))
    }

    /// Remove an abandoned lock, leaving one re-taken in the meantime alone.
    async fn break_lock(&self) -> Result<bool> {
        let Some(aside) = set_aside(&self.lock).await? else {
            return Ok(false);
        };
        if is_stale(&aside, self.stale_after).await {
            warn!(lock = %self.lock.display(), "breaking abandoned counter lock");
            remove_if_exists(&aside).await?;
            return Ok(true);
        }
        put_back(&aside, &self.lock).await?;
        Ok(false)
    }
}

async fn is_stale(path: &Path, stale_after: Duration) -> bool {
    let Ok(meta) = fs::metadata(path).await else {
        return false;
    };
    meta.modified()
        .ok()
        .and_then(|at| SystemTime::now().duration_since(at).ok())
        .is_some_and(|age| age > stale_after)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reserve_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub");
        let counter = PersistentCounter::new(&path, Duration::from_secs(60));
        assert_eq!(counter.reserve(1).await.unwrap(), 0);
        assert_eq!(counter.reserve(3).await.unwrap(), 1);

        let reopened = PersistentCounter::new(&path, Duration::from_secs(60));
        assert_eq!(reopened.reserve(1).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_concurrent_reservations_are_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub");
        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter = PersistentCounter::new(&path, Duration::from_secs(60));
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                for _ in 0..25 {
                    got.push(counter.reserve(1).await.unwrap());
                }
                got
            }));
        }
        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 200);
    }

    #[tokio::test]
    async fn test_abandoned_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub");
        let counter = PersistentCounter::new(&path, Duration::ZERO);
        fs::write(dir.path().join("hub.LCK"), b"1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.reserve(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fresh_lock_is_not_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub");
        let counter = PersistentCounter::new(&path, Duration::from_secs(60));
        let lock = dir.path().join("hub.LCK");
        fs::write(&lock, b"1").await.unwrap();

        assert!(!counter.break_lock().await.unwrap());
        assert_eq!(fs::read(&lock).await.unwrap(), b"1");
        assert_eq!(crate::fsutil::list_names(dir.path()).await.unwrap(), vec!["hub.LCK".to_string()]);
    }
}
