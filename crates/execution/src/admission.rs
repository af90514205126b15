//! Execution admission control.
//!
//! Three independent lock scopes gate execution workers:
//!
//! - a global slot (`LXQ.<n>`), capping how many workers run at once;
//! - a per-command lock (`LXQ.cmd.<name>`), so one command family is only
//!   processed by one worker at a time;
//! - a per-execute-file lock (`LXF.<peer>.<file>`), claimed once per file,
//!   plus a directory lock (`LXQ.dir`) for the maintenance purge, which
//!   never coexists with a file lock.
//!
//! None of them wait. Every acquisition is a single exclusive create and
//! reports contention instead of blocking.

use spoolman_core::{ArtifactName, PeerName};
use spoolman_storage::fsutil::list_names;
use spoolman_storage::{break_if_stale, LockFile, LockOutcome, Result, SpoolLayout};
use tokio::fs;
use tracing::{debug, info, warn};

const SLOT_PREFIX: &str = "LXQ.";
const COMMAND_PREFIX: &str = "LXQ.cmd.";
const FILE_PREFIX: &str = "LXF.";
const DIRECTORY_LOCK: &str = "LXQ.dir";

/// Outcome of asking for an execution slot.
#[derive(Debug)]
#[must_use]
pub enum Admission {
    /// The worker may run; release the permit when done
    Admitted(ExecutionPermit),
    /// Every global slot is taken
    GlobalSlotDenied,
    /// Another worker is processing this command
    CommandLocked,
}

impl Admission {
    /// The permit, if admitted.
    pub fn into_permit(self) -> Option<ExecutionPermit> {
        match self {
            Admission::Admitted(permit) => Some(permit),
            _ => None,
        }
    }
}

/// A held global slot and command lock.
///
/// Fields drop in declaration order, so without an explicit release the
/// command lock still goes before the slot.
#[derive(Debug)]
pub struct ExecutionPermit {
    command: String,
    command_lock: LockFile,
    slot: Option<(usize, LockFile)>,
}

impl ExecutionPermit {
    /// Command this permit covers.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Global slot number, `None` when slots are unlimited.
    pub fn slot(&self) -> Option<usize> {
        self.slot.as_ref().map(|(n, _)| *n)
    }
}

/// A claimed execute file.
#[derive(Debug)]
pub struct FileLock {
    lock: LockFile,
}

impl FileLock {
    /// Release the claim.
    pub async fn unlock(self) -> Result<()> {
        self.lock.release().await
    }
}

/// Exclusive access to the execution working directory.
#[derive(Debug)]
pub struct DirectoryLock {
    layout: SpoolLayout,
    lock: LockFile,
}

impl DirectoryLock {
    /// Remove everything in the working directory, then release the lock.
    ///
    /// Returns how many entries were removed. The lock is released even if
    /// some entry could not be removed; the first such error is returned.
    pub async fn unlock_and_purge(self) -> Result<usize> {
        let dir = self.layout.xqt_dir();
        let mut removed = 0;
        let mut first_error = None;
        for name in list_names(&dir).await? {
            let path = dir.join(&name);
            let result = match fs::symlink_metadata(&path).await {
                Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path).await,
                Ok(_) => fs::remove_file(&path).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "could not purge");
                    first_error.get_or_insert(e);
                }
            }
        }
        self.lock.release().await?;
        info!(removed, "execution directory purged and unlocked");
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(removed),
        }
    }
}

/// Hands out execution slots and locks.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    layout: SpoolLayout,
    max_xqts: usize,
}

impl AdmissionController {
    /// Controller allowing `max_xqts` concurrent workers; 0 means no cap.
    pub fn new(layout: SpoolLayout, max_xqts: usize) -> Self {
        Self { layout, max_xqts }
    }

    /// Configured ceiling.
    pub fn max_xqts(&self) -> usize {
        self.max_xqts
    }

    /// Try to take a global slot and the lock for `command`.
    ///
    /// Denied outright if every slot is taken; otherwise denied if another
    /// worker holds `command`, in which case the slot just taken is given
    /// back before returning.
    pub async fn acquire_slot(&self, command: &str) -> Result<Admission> {
        let slot = if self.max_xqts == 0 {
            None
        } else {
            let mut taken = None;
            for n in 0..self.max_xqts {
                let path = self.layout.locks_dir().join(format!("{SLOT_PREFIX}{n}"));
                if let LockOutcome::Acquired(lock) = LockFile::try_acquire(path).await? {
                    taken = Some((n, lock));
                    break;
                }
            }
            match taken {
                Some(slot) => Some(slot),
                None => {
                    debug!(command, max = self.max_xqts, "no execution slot free");
                    return Ok(Admission::GlobalSlotDenied);
                }
            }
        };

        match LockFile::try_acquire(self.command_lock_path(command)).await? {
            LockOutcome::Acquired(command_lock) => {
                debug!(command, slot = ?slot.as_ref().map(|(n, _)| *n), "execution admitted");
                Ok(Admission::Admitted(ExecutionPermit {
                    command: command.to_string(),
                    command_lock,
                    slot,
                }))
            }
            LockOutcome::Contended => {
                if let Some((_, lock)) = slot {
                    lock.release().await?;
                }
                debug!(command, "command already being processed");
                Ok(Admission::CommandLocked)
            }
        }
    }

    /// Give back a permit: the command lock first, then the slot.
    pub async fn release_slot(&self, permit: ExecutionPermit) -> Result<()> {
        let ExecutionPermit {
            command,
            command_lock,
            slot,
        } = permit;
        let released = command_lock.release().await;
        if let Some((_, lock)) = slot {
            lock.release().await?;
        }
        released?;
        debug!(command = %command, "execution slot released");
        Ok(())
    }

    /// Whether some worker is processing `command`.
    pub async fn is_command_locked(&self, command: &str) -> bool {
        fs::try_exists(self.command_lock_path(command))
            .await
            .unwrap_or(false)
    }

    /// Claim one execute file.
    ///
    /// Contended if another worker holds it or the directory is locked for
    /// a purge.
    pub async fn lock_file(&self, peer: &PeerName, name: &ArtifactName) -> Result<LockOutcome<FileLock>> {
        let path = self.layout.locks_dir().join(format!("{FILE_PREFIX}{peer}.{name}"));
        let lock = match LockFile::try_acquire(path).await? {
            LockOutcome::Acquired(lock) => lock,
            LockOutcome::Contended => return Ok(LockOutcome::Contended),
        };
        if fs::try_exists(self.directory_lock_path()).await? {
            lock.release().await?;
            debug!(peer = %peer, name = %name, "execution directory locked, backing off");
            return Ok(LockOutcome::Contended);
        }
        Ok(LockOutcome::Acquired(FileLock { lock }))
    }

    /// Release a claimed execute file.
    pub async fn unlock_file(&self, lock: FileLock) -> Result<()> {
        lock.unlock().await
    }

    /// Lock the working directory for a purge.
    ///
    /// Contended while any execute file is claimed by a live worker. Claims
    /// whose holder has died are broken on the way. Both sides create their
    /// own record before looking for the other, so when they race at worst
    /// both back off.
    pub async fn lock_directory(&self) -> Result<LockOutcome<DirectoryLock>> {
        let lock = match LockFile::try_acquire(self.directory_lock_path()).await? {
            LockOutcome::Acquired(lock) => lock,
            LockOutcome::Contended => return Ok(LockOutcome::Contended),
        };
        let mut claimed = 0usize;
        for name in list_names(&self.layout.locks_dir()).await? {
            if !name.starts_with(FILE_PREFIX) {
                continue;
            }
            // Claims left by crashed workers would otherwise block purges forever.
            if !break_if_stale(&self.layout.locks_dir().join(&name)).await? {
                claimed += 1;
            }
        }
        if claimed > 0 {
            lock.release().await?;
            debug!(claimed, "execute files in use, not locking directory");
            return Ok(LockOutcome::Contended);
        }
        fs::create_dir_all(self.layout.xqt_dir()).await?;
        Ok(LockOutcome::Acquired(DirectoryLock {
            layout: self.layout.clone(),
            lock,
        }))
    }

    fn command_lock_path(&self, command: &str) -> std::path::PathBuf {
        self.layout
            .locks_dir()
            .join(format!("{COMMAND_PREFIX}{}", sanitize(command)))
    }

    fn directory_lock_path(&self) -> std::path::PathBuf {
        self.layout.locks_dir().join(DIRECTORY_LOCK)
    }
}

/// Command names become file name components.
fn sanitize(command: &str) -> String {
    let base = command.rsplit('/').next().unwrap_or(command);
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
