//! Job identifier registry.
//!
//! Job identifiers are derived from command entry names, so any process can
//! resolve one by looking the entry up on disk. Cancellation and renewal
//! check ownership through an [`Authorizer`]; the registry itself only
//! decides whether the requester is the submitter.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::SystemTime;

use spoolman_core::{Command, Grade, JobId, PeerName, SequenceToken, Time};
use tokio::fs;
use tracing::{info, warn};

use crate::entry::{self, EntryManifest, MANIFEST};
use crate::fsutil::{read_json, remove_if_exists, write_atomic};
use crate::layout::SpoolLayout;
use crate::queue::{WorkCursor, WorkQueue};
use crate::{Result, StorageError};

/// Decides who may touch jobs they did not submit.
pub trait Authorizer: Send + Sync {
    /// Whether `user` may cancel or renew anyone's jobs.
    fn is_privileged(&self, user: &str) -> bool;
}

/// Authorizer backed by a fixed list of user names.
#[derive(Debug, Clone, Default)]
pub struct PrivilegedUsers {
    users: HashSet<String>,
}

impl PrivilegedUsers {
    /// Privilege for exactly `users`.
    pub fn new<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            users: users.into_iter().map(Into::into).collect(),
        }
    }
}

impl Authorizer for PrivilegedUsers {
    fn is_privileged(&self, user: &str) -> bool {
        self.users.contains(user)
    }
}

/// A job located on disk.
#[derive(Debug, Clone)]
pub struct ResolvedJob {
    /// Identifier it was resolved from
    pub id: JobId,
    /// Batch grade
    pub grade: Grade,
    /// Submitting user
    pub submitter: String,
    /// Queue time, moved forward by renewal
    pub queued_at: Time,
    /// Entry directory
    pub location: PathBuf,
    /// Commands not yet retired, with their record index
    pub commands: Vec<(usize, Command)>,
}

impl ResolvedJob {
    /// Peer the job is queued for.
    pub fn peer(&self) -> &PeerName {
        self.id.peer()
    }
}

/// Resolves, cancels and renews jobs by identifier.
#[derive(Debug, Clone)]
pub struct JobRegistry {
    layout: SpoolLayout,
}

impl JobRegistry {
    /// Registry over the given spool.
    pub fn new(layout: SpoolLayout) -> Self {
        Self { layout }
    }

    /// Durable identifier for a command handed out by `cursor`.
    pub fn issue(&self, cursor: &WorkCursor, token: SequenceToken) -> Result<JobId> {
        cursor.job_id(token)
    }

    /// Locate a job. Fails with not found once it is fully retired or cancelled.
    pub async fn resolve(&self, id: &JobId) -> Result<ResolvedJob> {
        let location = self.layout.entry_dir(id.peer(), id.command_name());
        let manifest: EntryManifest = match entry::load_manifest(&location).await {
            Ok(Some(manifest)) => manifest,
            Ok(None) => return Err(StorageError::NotFound(format!("job {id}"))),
            Err(StorageError::Json(e)) => return Err(StorageError::corrupt(id.peer(), id.command_name(), e)),
            Err(e) => return Err(e),
        };

        let mut commands = Vec::new();
        for index in entry::record_indices(&location).await? {
            match read_json::<Command>(&location.join(entry::record_name(index))).await {
                Ok(Some(command)) => commands.push((index, command)),
                Ok(None) => {}
                Err(StorageError::Json(e)) => {
                    warn!(job = %id, index, error = %e, "unreadable command record");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(ResolvedJob {
            id: id.clone(),
            grade: manifest.grade,
            submitter: manifest.submitter,
            queued_at: manifest.queued_at,
            location,
            commands,
        })
    }

    /// When the job was queued or last renewed.
    pub async fn work_time(&self, id: &JobId) -> Result<Time> {
        Ok(self.resolve(id).await?.queued_at)
    }

    /// Every job queued for `peer`, in scan order.
    pub async fn list(&self, peer: &PeerName) -> Result<Vec<ResolvedJob>> {
        let mut jobs = Vec::new();
        for name in WorkQueue::new(self.layout.clone()).entries(peer).await? {
            let id = JobId::new(peer.clone(), name)?;
            match self.resolve(&id).await {
                Ok(job) => jobs.push(job),
                Err(e) if e.is_not_found() => {}
                Err(StorageError::Corrupt { peer, artifact, reason }) => {
                    warn!(peer = %peer, artifact = %artifact, %reason, "skipping corrupt queue entry");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(jobs)
    }

    /// Remove a job and every artifact it owns.
    ///
    /// The entry is first renamed out of the queue; whichever of this and a
    /// concurrent retirement lands first wins, and the loser sees not found.
    pub async fn cancel(&self, id: &JobId, requester: &str, auth: &dyn Authorizer) -> Result<ResolvedJob> {
        let job = self.resolve(id).await?;
        check_owner(&job, requester, auth)?;

        let trash = self.layout.temp_dir().join(format!("K.{}", ulid::Ulid::new()));
        fs::create_dir_all(self.layout.temp_dir()).await?;
        match fs::rename(&job.location, &trash).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(format!("job {id}")));
            }
            Err(e) => return Err(e.into()),
        }

        // Records may have been retired between resolve and rename; trust
        // what moved.
        for index in entry::record_indices(&trash).await? {
            let Ok(Some(command)) = read_json::<Command>(&trash.join(entry::record_name(index))).await else {
                continue;
            };
            if let Some(temp) = &command.temp {
                remove_if_exists(&self.layout.artifact_path(id.peer(), temp)).await?;
            }
        }
        fs::remove_dir_all(&trash).await?;

        info!(job = %id, requester, "job cancelled");
        Ok(job)
    }

    /// Reset a job's age so cleanup passes leave it alone.
    pub async fn renew(&self, id: &JobId, requester: &str, auth: &dyn Authorizer) -> Result<Time> {
        let job = self.resolve(id).await?;
        check_owner(&job, requester, auth)?;

        let now = chrono::Utc::now();
        let manifest = EntryManifest {
            peer: id.peer().clone(),
            grade: job.grade,
            submitter: job.submitter.clone(),
            queued_at: now,
            commands: job.commands.len(),
        };
        match write_atomic(&job.location.join(MANIFEST), &serde_json::to_vec_pretty(&manifest)?).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Err(StorageError::NotFound(format!("job {id}"))),
            Err(e) => return Err(e),
        }

        for (_, command) in &job.commands {
            if let Some(temp) = &command.temp {
                touch(&self.layout.artifact_path(id.peer(), temp)).await?;
            }
        }

        info!(job = %id, requester, "job renewed");
        Ok(now)
    }
}

fn check_owner(job: &ResolvedJob, requester: &str, auth: &dyn Authorizer) -> Result<()> {
    if job.submitter == requester || auth.is_privileged(requester) {
        Ok(())
    } else {
        Err(StorageError::PermissionDenied {
            user: requester.to_string(),
            job: job.id.to_string(),
        })
    }
}

async fn touch(path: &std::path::Path) -> Result<()> {
    let file = match fs::OpenOptions::new().write(true).open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let file = file.into_std().await;
    tokio::task::spawn_blocking(move || file.set_modified(SystemTime::now()))
        .await
        .map_err(std::io::Error::other)??;
    Ok(())
}
