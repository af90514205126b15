//! Work queue scanner.
//!
//! A [`WorkCursor`] snapshots a peer's command entries when opened, keeps
//! the admissible ones in grade order, and hands out one command at a time
//! together with a [`SequenceToken`] that only this cursor understands.
//! Retiring a command removes its record first (the commit point) and its
//! temp file second, so a crash in between can orphan a data file but never
//! resurrect the command.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use spoolman_core::{
    ArtifactKind, ArtifactName, Command, Grade, JobId, PeerName, SequenceToken, Time,
};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::entry::{self, EntryManifest};
use crate::fsutil::{list_names, read_json, remove_if_exists};
use crate::layout::SpoolLayout;
use crate::{Result, StorageError};

static NEXT_CURSOR: AtomicU64 = AtomicU64::new(1);

/// One admitted command.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    /// Handle for retiring this command through its cursor
    pub token: SequenceToken,
    /// Durable identifier of the batch it belongs to
    pub job_id: JobId,
    /// Batch grade
    pub grade: Grade,
    /// The command itself
    pub command: Command,
    /// Submitter of the batch
    pub submitter: String,
    /// When the batch was queued or last renewed
    pub queued_at: Time,
}

#[derive(Debug, Clone)]
struct Slot {
    entry: ArtifactName,
    index: usize,
    temp: Option<ArtifactName>,
    queued_at: Time,
    retired: bool,
}

/// Scans per-peer queues.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    layout: SpoolLayout,
}

impl WorkQueue {
    /// Queue over the given spool.
    pub fn new(layout: SpoolLayout) -> Self {
        Self { layout }
    }

    /// Open a cursor over `peer`'s queue.
    ///
    /// Uppercase grades are always admitted; lowercase grades only when they
    /// are `<= min_grade`. A `read_only` cursor is for inspection: it never
    /// retires or moves anything.
    pub async fn open(&self, peer: &PeerName, min_grade: Grade, read_only: bool) -> Result<WorkCursor> {
        let pending: VecDeque<ArtifactName> = self
            .entries(peer)
            .await?
            .into_iter()
            .filter(|name| name.grade().admitted_by(min_grade))
            .collect();

        let id = NEXT_CURSOR.fetch_add(1, Ordering::Relaxed);
        debug!(peer = %peer, cursor = id, entries = pending.len(), %min_grade, read_only, "work cursor opened");

        Ok(WorkCursor {
            id,
            peer: peer.clone(),
            layout: self.layout.clone(),
            read_only,
            pending,
            buffered: VecDeque::new(),
            arena: Vec::new(),
        })
    }

    /// Highest grade with queued work for `peer`, if any.
    pub async fn has_work(&self, peer: &PeerName) -> Result<Option<Grade>> {
        Ok(self.entries(peer).await?.first().map(ArtifactName::grade))
    }

    /// Valid command entry names for `peer`, in grade then sequence order.
    pub(crate) async fn entries(&self, peer: &PeerName) -> Result<Vec<ArtifactName>> {
        let mut entries = Vec::new();
        for name in list_names(&self.layout.command_dir(peer)).await? {
            // Batches still being written are hidden.
            if name.starts_with('.') {
                continue;
            }
            match name.parse::<ArtifactName>() {
                Ok(artifact)
                    if artifact.kind() == ArtifactKind::Command
                        && artifact.component() == peer.component() =>
                {
                    // Drained entries awaiting removal hold no work.
                    match entry::record_indices(&self.layout.entry_dir(peer, &artifact)).await {
                        Ok(indices) if indices.is_empty() => {
                            debug!(peer = %peer, entry = %artifact, "command entry has no records, skipping")
                        }
                        Ok(_) => entries.push(artifact),
                        Err(e) => warn!(peer = %peer, entry = %artifact, error = %e, "unreadable command entry, skipping"),
                    }
                }
                Ok(_) => warn!(peer = %peer, name = %name, "foreign entry in command directory, skipping"),
                Err(e) => warn!(peer = %peer, name = %name, error = %e, "malformed command entry name, skipping"),
            }
        }
        entries.sort_by(|a, b| {
            a.grade()
                .cmp(&b.grade())
                .then(a.sequence().cmp(&b.sequence()))
                .then(a.cmp(b))
        });
        Ok(entries)
    }
}

/// A restartable pass over one peer's admissible work.
#[derive(Debug)]
pub struct WorkCursor {
    id: u64,
    peer: PeerName,
    layout: SpoolLayout,
    read_only: bool,
    pending: VecDeque<ArtifactName>,
    buffered: VecDeque<QueuedJob>,
    arena: Vec<Slot>,
}

impl WorkCursor {
    /// Peer being scanned.
    pub fn peer(&self) -> &PeerName {
        &self.peer
    }

    /// Whether the cursor was opened for inspection only.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Next admissible command, or `None` at the end of the queue.
    ///
    /// Entries that vanish after the cursor was opened are skipped silently;
    /// entries that cannot be read are logged and skipped.
    pub async fn next(&mut self) -> Result<Option<QueuedJob>> {
        loop {
            if let Some(job) = self.buffered.pop_front() {
                return Ok(Some(job));
            }
            let Some(entry) = self.pending.pop_front() else {
                return Ok(None);
            };
            match self.load(&entry).await {
                Ok(()) => {}
                Err(StorageError::Corrupt { peer, artifact, reason }) => {
                    warn!(peer = %peer, artifact = %artifact, %reason, "skipping corrupt queue entry");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Durable identifier of the batch a token belongs to.
    pub fn job_id(&self, token: SequenceToken) -> Result<JobId> {
        let slot = self.slot(token)?;
        Ok(JobId::new(self.peer.clone(), slot.entry.clone())?)
    }

    /// When the command's batch was queued or last renewed.
    pub fn work_time(&self, token: SequenceToken) -> Result<Time> {
        Ok(self.slot(token)?.queued_at)
    }

    /// Retire a completed command: drop its record, then its temp file.
    ///
    /// Retiring the same command twice, or one that was cancelled in the
    /// meantime, reports not found.
    pub async fn complete(&mut self, token: SequenceToken) -> Result<()> {
        self.writable()?;
        let slot = self.slot(token)?.clone();
        if slot.retired {
            return Err(StorageError::NotFound(format!("{} already retired", token)));
        }

        let dir = self.layout.entry_dir(&self.peer, &slot.entry);
        match fs::remove_file(dir.join(entry::record_name(slot.index))).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.mark_retired(token);
                return Err(StorageError::NotFound(format!(
                    "command {} of {}",
                    slot.index, slot.entry
                )));
            }
            Err(e) => return Err(e.into()),
        }
        self.mark_retired(token);

        let mut first_error = None;
        if let Some(temp) = &slot.temp {
            if let Err(e) = remove_if_exists(&self.layout.artifact_path(&self.peer, temp)).await {
                warn!(peer = %self.peer, artifact = %temp, error = %e, "could not remove temp file of retired command");
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = entry::retire_if_empty(&dir).await {
            warn!(peer = %self.peer, artifact = %slot.entry, error = %e, "could not remove drained command entry");
            first_error.get_or_insert(e);
        }

        info!(peer = %self.peer, entry = %slot.entry, index = slot.index, "command retired");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Keep the temp file of a failed send and say where it went.
    ///
    /// Returns `None` when the command has no temp file. The command itself
    /// stays queued: callers retire it with [`WorkCursor::complete`] next,
    /// which tolerates the missing temp file. Left queued, later passes skip
    /// it as a command whose data is gone.
    pub async fn save_temp_file(&mut self, token: SequenceToken) -> Result<Option<PathBuf>> {
        self.writable()?;
        let slot = self.slot(token)?.clone();
        let Some(temp) = slot.temp else {
            return Ok(None);
        };

        let from = self.layout.artifact_path(&self.peer, &temp);
        let dir = self.layout.preserve_dir().join(self.peer.as_str());
        fs::create_dir_all(&dir).await?;
        let to = dir.join(temp.as_str());
        match fs::rename(&from, &to).await {
            Ok(()) => {
                info!(peer = %self.peer, artifact = %temp, saved = %to.display(), "temp file preserved");
                Ok(Some(to))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(format!("temp file {temp}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stop scanning. Unvisited entries stay queued.
    pub fn close(self) {
        debug!(peer = %self.peer, cursor = self.id, unvisited = self.pending.len(), "work cursor closed");
    }

    async fn load(&mut self, entry: &ArtifactName) -> Result<()> {
        let dir = self.layout.entry_dir(&self.peer, entry);
        let manifest: EntryManifest = match entry::load_manifest(&dir).await {
            Ok(Some(manifest)) => manifest,
            Ok(None) => {
                debug!(peer = %self.peer, entry = %entry, "entry vanished before it was read");
                return Ok(());
            }
            Err(StorageError::Json(e)) => {
                return Err(StorageError::corrupt(&self.peer, entry, e));
            }
            Err(e) => return Err(e),
        };

        let job_id = JobId::new(self.peer.clone(), entry.clone())?;
        for index in entry::record_indices(&dir).await? {
            let path = dir.join(entry::record_name(index));
            let command: Command = match read_json(&path).await {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(StorageError::Json(e)) => {
                    warn!(peer = %self.peer, artifact = %entry, index, error = %e, "unreadable command record, skipping");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if let Some(temp) = &command.temp {
                let temp_path = self.layout.artifact_path(&self.peer, temp);
                if !fs::try_exists(&temp_path).await? {
                    warn!(peer = %self.peer, artifact = %temp, entry = %entry, index, "command references a missing temp file, skipping");
                    continue;
                }
            }

            let token = SequenceToken::new(self.id, self.arena.len());
            self.arena.push(Slot {
                entry: entry.clone(),
                index,
                temp: command.temp.clone(),
                queued_at: manifest.queued_at,
                retired: false,
            });
            self.buffered.push_back(QueuedJob {
                token,
                job_id: job_id.clone(),
                grade: manifest.grade,
                command,
                submitter: manifest.submitter.clone(),
                queued_at: manifest.queued_at,
            });
        }
        Ok(())
    }

    fn slot(&self, token: SequenceToken) -> Result<&Slot> {
        if token.cursor() != self.id {
            return Err(StorageError::InvalidToken(token.to_string()));
        }
        self.arena
            .get(token.index())
            .ok_or_else(|| StorageError::InvalidToken(token.to_string()))
    }

    fn mark_retired(&mut self, token: SequenceToken) {
        if let Some(slot) = self.arena.get_mut(token.index()) {
            slot.retired = true;
        }
    }

    fn writable(&self) -> Result<()> {
        if self.read_only {
            Err(StorageError::ReadOnly)
        } else {
            Ok(())
        }
    }
}
