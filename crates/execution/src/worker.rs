//! One execution pass over the queued execute files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use spoolman_core::{ArtifactName, ExecuteDescriptor, PeerName, RequiredFile};
use spoolman_storage::fsutil::remove_if_exists;
use spoolman_storage::{LockOutcome, Result, SpoolLayout};
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::admission::{Admission, AdmissionController};
use crate::scanner::{ExecuteScanner, QueuedExecute};

/// What became of a command that was handed to the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// It ran and exited successfully
    Succeeded,
    /// It ran and failed
    Failed {
        /// Exit code, if it exited normally
        code: Option<i32>,
    },
    /// The command is not permitted here
    Refused,
}

/// Everything a runner needs to execute one request.
#[derive(Debug, Clone)]
pub struct ExecuteJob {
    /// Peer the request came from
    pub peer: PeerName,
    /// Execute file name
    pub name: ArtifactName,
    /// Parsed request
    pub descriptor: ExecuteDescriptor,
    /// Scratch directory for this run, removed afterwards
    pub workdir: PathBuf,
    /// Required files and where they are in the spool
    pub files: Vec<(RequiredFile, PathBuf)>,
}

impl ExecuteJob {
    /// Spool path of a file named by the descriptor.
    pub fn spool_path(&self, spool_name: &str) -> Option<&Path> {
        self.files
            .iter()
            .find(|(file, _)| file.spool_name == spool_name)
            .map(|(_, path)| path.as_path())
    }
}

/// Runs commands on behalf of the worker.
///
/// An `Err` means the command could not be started at all; the execute file
/// is then left queued for a later pass.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run one request.
    async fn run(&self, job: &ExecuteJob) -> anyhow::Result<RunOutcome>;
}

/// Summary of one pass.
#[derive(Debug, Default)]
pub struct PassReport {
    /// Execute files handed to the runner, with the outcome
    pub executed: Vec<(ArtifactName, RunOutcome)>,
    /// Skipped because another worker holds them
    pub busy: usize,
    /// Waiting for data files to arrive
    pub waiting: usize,
    /// Skipped because their command family is being processed elsewhere
    pub command_locked: usize,
    /// Unparseable descriptors moved aside
    pub corrupt: usize,
    /// Runner could not start the command
    pub errors: usize,
    /// The pass stopped early because every slot was taken
    pub slots_exhausted: bool,
}

/// Drives queued execute files through a [`CommandRunner`].
#[derive(Debug, Clone)]
pub struct XqtWorker {
    layout: SpoolLayout,
    admission: AdmissionController,
    scanner: ExecuteScanner,
}

enum Step {
    Continue,
    Stop,
}

impl XqtWorker {
    /// Worker over the given spool.
    pub fn new(layout: SpoolLayout, admission: AdmissionController) -> Self {
        Self {
            scanner: ExecuteScanner::new(layout.clone()),
            layout,
            admission,
        }
    }

    /// Process every execute file that can run now.
    ///
    /// For each file: claim it, check its data has arrived, take a slot and
    /// the command lock, run it, then remove the execute file with its data
    /// files. Locks are released in reverse order on every path.
    pub async fn run_once(&self, runner: &dyn CommandRunner) -> Result<PassReport> {
        let mut report = PassReport::default();
        for queued in self.scanner.scan().await? {
            let claim = match self.admission.lock_file(&queued.peer, &queued.name).await? {
                LockOutcome::Acquired(claim) => claim,
                LockOutcome::Contended => {
                    report.busy += 1;
                    continue;
                }
            };
            let step = self.process(&queued, runner, &mut report).await;
            let unlocked = self.admission.unlock_file(claim).await;
            let step = step?;
            if let Err(e) = unlocked {
                warn!(peer = %queued.peer, name = %queued.name, error = %e, "failed to release execute file lock");
            }
            if let Step::Stop = step {
                report.slots_exhausted = true;
                break;
            }
        }
        info!(
            executed = report.executed.len(),
            busy = report.busy,
            waiting = report.waiting,
            command_locked = report.command_locked,
            corrupt = report.corrupt,
            errors = report.errors,
            "execution pass finished"
        );
        Ok(report)
    }

    async fn process(
        &self,
        queued: &QueuedExecute,
        runner: &dyn CommandRunner,
        report: &mut PassReport,
    ) -> Result<Step> {
        let text = match fs::read_to_string(&queued.path).await {
            Ok(text) => text,
            // Finished by another worker between scan and claim.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Step::Continue),
            Err(e) => return Err(e.into()),
        };
        let descriptor = match text.parse::<ExecuteDescriptor>() {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.set_aside(queued, &e.to_string()).await?;
                report.corrupt += 1;
                return Ok(Step::Continue);
            }
        };

        let mut files = Vec::with_capacity(descriptor.files.len());
        for file in &descriptor.files {
            let name = match file.spool_name.parse::<ArtifactName>() {
                Ok(name) => name,
                Err(e) => {
                    self.set_aside(queued, &format!("{}: {e}", file.spool_name)).await?;
                    report.corrupt += 1;
                    return Ok(Step::Continue);
                }
            };
            let path = self.layout.artifact_path(&queued.peer, &name);
            if !fs::try_exists(&path).await? {
                debug!(peer = %queued.peer, name = %queued.name, missing = %name, "execute file waiting for data");
                report.waiting += 1;
                return Ok(Step::Continue);
            }
            files.push((file.clone(), path));
        }

        let command = descriptor.command_name().to_string();
        let permit = match self.admission.acquire_slot(&command).await? {
            Admission::Admitted(permit) => permit,
            Admission::GlobalSlotDenied => return Ok(Step::Stop),
            Admission::CommandLocked => {
                report.command_locked += 1;
                return Ok(Step::Continue);
            }
        };

        let workdir = self.layout.xqt_dir().join(ulid::Ulid::new().to_string());
        let job = ExecuteJob {
            peer: queued.peer.clone(),
            name: queued.name.clone(),
            descriptor,
            workdir,
            files,
        };
        let ran = self.run(&job, runner).await;
        let released = self.admission.release_slot(permit).await;

        match ran {
            Ok(Some(outcome)) => {
                self.retire(&job).await?;
                report.executed.push((job.name.clone(), outcome));
            }
            Ok(None) => report.errors += 1,
            Err(e) => return Err(e),
        }
        released?;
        Ok(Step::Continue)
    }

    async fn run(&self, job: &ExecuteJob, runner: &dyn CommandRunner) -> Result<Option<RunOutcome>> {
        fs::create_dir_all(&job.workdir).await?;
        let result = runner.run(job).await;
        if let Err(e) = fs::remove_dir_all(&job.workdir).await {
            warn!(workdir = %job.workdir.display(), error = %e, "could not remove run directory");
        }
        match result {
            Ok(outcome) => {
                info!(
                    peer = %job.peer,
                    name = %job.name,
                    command = job.descriptor.command_name(),
                    user = %job.descriptor.user,
                    ?outcome,
                    "executed"
                );
                Ok(Some(outcome))
            }
            Err(e) => {
                error!(peer = %job.peer, name = %job.name, error = %e, "could not start command, leaving it queued");
                Ok(None)
            }
        }
    }

    /// Remove a finished execute file and the data it consumed.
    async fn retire(&self, job: &ExecuteJob) -> Result<()> {
        remove_if_exists(&self.layout.artifact_path(&job.peer, &job.name)).await?;
        for (_, path) in &job.files {
            remove_if_exists(path).await?;
        }
        Ok(())
    }

    /// Move an unusable execute file out of the queue.
    async fn set_aside(&self, queued: &QueuedExecute, reason: &str) -> Result<()> {
        let dir = self.layout.preserve_dir().join(queued.peer.as_str());
        fs::create_dir_all(&dir).await?;
        let target = dir.join(queued.name.as_str());
        fs::rename(&queued.path, &target).await?;
        warn!(
            peer = %queued.peer,
            name = %queued.name,
            reason,
            saved = %target.display(),
            "corrupt execute file set aside"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, Vec<String>, bool)>>,
        fail_to_start: bool,
    }

    #[async_trait]
    impl CommandRunner for Recorder {
        async fn run(&self, job: &ExecuteJob) -> anyhow::Result<RunOutcome> {
            if self.fail_to_start {
                anyhow::bail!("no such program");
            }
            let input_present = job
                .descriptor
                .input
                .as_deref()
                .and_then(|input| job.spool_path(input))
                .is_some_and(Path::exists);
            self.seen.lock().unwrap().push((
                job.name.to_string(),
                job.descriptor.argv.clone(),
                input_present && job.workdir.is_dir(),
            ));
            Ok(RunOutcome::Succeeded)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        layout: SpoolLayout,
        hub: PeerName,
        worker: XqtWorker,
    }

    async fn fixture(max: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let layout = SpoolLayout::new(dir.path());
        layout.ensure().await.unwrap();
        let hub = PeerName::new("hub").unwrap();
        layout.ensure_peer(&hub).await.unwrap();
        Fixture {
            worker: XqtWorker::new(layout.clone(), AdmissionController::new(layout.clone(), max)),
            layout,
            hub,
            _dir: dir,
        }
    }

    impl Fixture {
        async fn queue(&self, name: &str, text: &str) -> PathBuf {
            let path = self.layout.execute_dir(&self.hub).join(name);
            fs::write(&path, text).await.unwrap();
            path
        }

        async fn data(&self, name: &str) -> PathBuf {
            let name: ArtifactName = name.parse().unwrap();
            let path = self.layout.artifact_path(&self.hub, &name);
            fs::write(&path, b"mail body").await.unwrap();
            path
        }
    }

    const MAIL: &str = "U alice hub\nF D.hub0000X00001\nI D.hub0000X00001\nC rmail bob\n";

    #[tokio::test]
    async fn test_runs_and_retires_complete_request() {
        let f = fixture(2).await;
        let data = f.data("D.hub0000X00001").await;
        let xqt = f.queue("X.hub0000X00001", MAIL).await;

        let runner = Recorder::default();
        let report = f.worker.run_once(&runner).await.unwrap();
        assert_eq!(report.executed.len(), 1);
        assert_eq!(report.executed[0].1, RunOutcome::Succeeded);
        let seen = runner.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![("X.hub0000X00001".to_string(), vec!["rmail".to_string(), "bob".to_string()], true)]);
        assert!(!xqt.exists());
        assert!(!data.exists());

        // Every lock is gone and the working directory is clean.
        let locks = spoolman_storage::fsutil::list_names(&f.layout.locks_dir()).await.unwrap();
        assert!(locks.is_empty(), "left behind: {locks:?}");
        let scratch = spoolman_storage::fsutil::list_names(&f.layout.xqt_dir()).await.unwrap();
        assert!(scratch.is_empty());
    }

    #[tokio::test]
    async fn test_waits_for_missing_data() {
        let f = fixture(2).await;
        let xqt = f.queue("X.hub0000X00001", MAIL).await;

        let runner = Recorder::default();
        let report = f.worker.run_once(&runner).await.unwrap();
        assert_eq!(report.waiting, 1);
        assert!(report.executed.is_empty());
        assert!(xqt.exists());

        f.data("D.hub0000X00001").await;
        let report = f.worker.run_once(&runner).await.unwrap();
        assert_eq!(report.executed.len(), 1);
    }

    #[tokio::test]
    async fn test_claimed_file_is_skipped() {
        let f = fixture(2).await;
        f.data("D.hub0000X00001").await;
        f.queue("X.hub0000X00001", MAIL).await;
        let admission = AdmissionController::new(f.layout.clone(), 2);
        let name: ArtifactName = "X.hub0000X00001".parse().unwrap();
        let claim = admission.lock_file(&f.hub, &name).await.unwrap().into_guard().unwrap();

        let report = f.worker.run_once(&Recorder::default()).await.unwrap();
        assert_eq!(report.busy, 1);
        claim.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_locked_command_family_is_deferred() {
        let f = fixture(4).await;
        f.data("D.hub0000X00001").await;
        let xqt = f.queue("X.hub0000X00001", MAIL).await;
        let other = AdmissionController::new(f.layout.clone(), 4);
        let permit = other.acquire_slot("rmail").await.unwrap().into_permit().unwrap();

        let report = f.worker.run_once(&Recorder::default()).await.unwrap();
        assert_eq!(report.command_locked, 1);
        assert!(xqt.exists());
        other.release_slot(permit).await.unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_slots_stop_the_pass() {
        let f = fixture(1).await;
        f.data("D.hub0000X00001").await;
        f.queue("X.hub0000X00001", MAIL).await;
        let other = AdmissionController::new(f.layout.clone(), 1);
        let permit = other.acquire_slot("rnews").await.unwrap().into_permit().unwrap();

        let report = f.worker.run_once(&Recorder::default()).await.unwrap();
        assert!(report.slots_exhausted);
        assert!(report.executed.is_empty());
        other.release_slot(permit).await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_descriptor_set_aside() {
        let f = fixture(2).await;
        let xqt = f.queue("X.hub0000X00002", "C rmail bob\n").await;
        let report = f.worker.run_once(&Recorder::default()).await.unwrap();
        assert_eq!(report.corrupt, 1);
        assert!(!xqt.exists());
        assert!(f.layout.preserve_dir().join("hub").join("X.hub0000X00002").exists());
    }

    #[tokio::test]
    async fn test_start_failure_leaves_request_queued() {
        let f = fixture(2).await;
        let data = f.data("D.hub0000X00001").await;
        let xqt = f.queue("X.hub0000X00001", MAIL).await;
        let runner = Recorder {
            fail_to_start: true,
            ..Recorder::default()
        };
        let report = f.worker.run_once(&runner).await.unwrap();
        assert_eq!(report.errors, 1);
        assert!(xqt.exists());
        assert!(data.exists());
        let locks = spoolman_storage::fsutil::list_names(&f.layout.locks_dir()).await.unwrap();
        assert!(locks.is_empty(), "left behind: {locks:?}");
    }
}
