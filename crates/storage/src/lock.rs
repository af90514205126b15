//! Per-peer session lock.

use spoolman_core::PeerName;
use tracing::{debug, info};

use crate::layout::SpoolLayout;
use crate::lockfile::{read_record, LockFile, LockOutcome, LockRecord};
use crate::{Result, StorageError};

/// Guarantees at most one session per peer across all processes.
#[derive(Debug, Clone)]
pub struct SystemLock {
    layout: SpoolLayout,
}

/// Proof that a session with a peer may proceed.
#[derive(Debug)]
pub struct SystemLockGuard {
    peer: PeerName,
    lock: LockFile,
}

impl SystemLock {
    /// Lock records live in the spool's lock directory.
    pub fn new(layout: SpoolLayout) -> Self {
        Self { layout }
    }

    /// Try to start a session with `peer`.
    ///
    /// `Contended` means another session is running; callers should skip the
    /// peer and let the scheduler retry later.
    pub async fn acquire(&self, peer: &PeerName) -> Result<LockOutcome<SystemLockGuard>> {
        let outcome = LockFile::try_acquire(self.layout.system_lock(peer)).await?;
        match &outcome {
            LockOutcome::Acquired(_) => info!(peer = %peer, "system locked"),
            LockOutcome::Contended => debug!(peer = %peer, "system already locked"),
        }
        Ok(outcome.map(|lock| SystemLockGuard {
            peer: peer.clone(),
            lock,
        }))
    }

    /// Remove a peer's lock record by name, e.g. after a crashed session.
    pub async fn release(&self, peer: &PeerName) -> Result<()> {
        let path = self.layout.system_lock(peer);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(format!("system lock for {peer}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a session with `peer` is in progress.
    pub async fn is_locked(&self, peer: &PeerName) -> bool {
        tokio::fs::try_exists(self.layout.system_lock(peer))
            .await
            .unwrap_or(false)
    }

    /// Every held session lock, with its holder when readable.
    pub async fn held(&self) -> Result<Vec<(PeerName, Option<LockRecord>)>> {
        let dir = self.layout.locks_dir();
        let mut held = Vec::new();
        for name in crate::fsutil::list_names(&dir).await? {
            let Some(peer) = name.strip_prefix("LCK..") else { continue };
            let Ok(peer) = PeerName::new(peer) else { continue };
            held.push((peer, read_record(&dir.join(&name)).await));
        }
        held.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(held)
    }
}

impl SystemLockGuard {
    /// Peer this session is with.
    pub fn peer(&self) -> &PeerName {
        &self.peer
    }

    /// End the session. Failure is reported but callers usually only log it.
    pub async fn release(self) -> Result<()> {
        let peer = self.peer;
        self.lock.release().await?;
        info!(peer = %peer, "system unlocked");
        Ok(())
    }
}
