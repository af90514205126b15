//! Runs execute requests as local processes.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use spoolman_execution::{CommandRunner, ExecuteJob, RunOutcome};
use tokio::process::Command;
use tracing::{debug, warn};

/// Spawns permitted commands in the run's working directory.
pub struct ProcessRunner {
    allowed: Vec<String>,
    output_dir: PathBuf,
}

impl ProcessRunner {
    /// Runner permitting exactly `allowed` command names. Kept standard
    /// output lands under `output_dir`, one directory per peer.
    pub fn new(allowed: Vec<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            allowed,
            output_dir: output_dir.into(),
        }
    }
}

/// A single plain file name: no directories, nothing hidden.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains(&['/', '\\', '\0'][..])
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, job: &ExecuteJob) -> anyhow::Result<RunOutcome> {
        let program = job.descriptor.command_name();
        if !self.allowed.iter().any(|allowed| allowed == program) {
            warn!(peer = %job.peer, command = program, user = %job.descriptor.user, "command not permitted");
            return Ok(RunOutcome::Refused);
        }

        // Output names come from the remote side and never leave the output area.
        let output = match &job.descriptor.output {
            Some(output) if output.peer.is_some() => {
                warn!(peer = %job.peer, file = %output.file, "output to another peer is discarded");
                None
            }
            Some(output) if !is_plain_name(&output.file) => {
                warn!(peer = %job.peer, file = %output.file, user = %job.descriptor.user, "refusing output path");
                return Ok(RunOutcome::Refused);
            }
            Some(output) => Some(self.output_dir.join(job.peer.as_str()).join(&output.file)),
            None => None,
        };

        // Files named for the command are copied in under that name.
        for (file, path) in &job.files {
            if let Some(local) = &file.local_name {
                if !is_plain_name(local) {
                    warn!(peer = %job.peer, name = %local, "ignoring unsafe local file name");
                    continue;
                }
                tokio::fs::copy(path, job.workdir.join(local)).await?;
            }
        }

        let stdin = match job.descriptor.input.as_deref() {
            Some(input) => match job.spool_path(input) {
                Some(path) => Stdio::from(std::fs::File::open(path)?),
                None => anyhow::bail!("input {input} is not one of the request's files"),
            },
            None => Stdio::null(),
        };
        let stdout = match &output {
            Some(path) => {
                if let Some(dir) = path.parent() {
                    tokio::fs::create_dir_all(dir).await?;
                }
                Stdio::from(std::fs::File::create(path)?)
            }
            None => Stdio::null(),
        };

        debug!(peer = %job.peer, argv = ?job.descriptor.argv, workdir = %job.workdir.display(), "spawning");
        let status = Command::new(program)
            .args(job.descriptor.argv.iter().skip(1))
            .current_dir(&job.workdir)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::null())
            .env("SPOOLMAN_USER", &job.descriptor.user)
            .env("SPOOLMAN_PEER", job.peer.as_str())
            .status()
            .await?;

        Ok(if status.success() {
            RunOutcome::Succeeded
        } else {
            RunOutcome::Failed { code: status.code() }
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use spoolman_core::{ExecuteDescriptor, PeerName, RequiredFile};
    use std::path::Path;

    const DATA: &str = "D.hub0000X00001";

    struct Run {
        _dir: tempfile::TempDir,
        root: PathBuf,
        runner: ProcessRunner,
    }

    fn setup(allowed: &[&str]) -> Run {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        std::fs::create_dir(root.join("work")).unwrap();
        std::fs::write(root.join(DATA), b"hello\n").unwrap();
        let runner = ProcessRunner::new(
            allowed.iter().map(|s| s.to_string()).collect(),
            root.join(".Output"),
        );
        Run { _dir: dir, root, runner }
    }

    fn job(root: &Path, request: &str) -> ExecuteJob {
        let descriptor: ExecuteDescriptor = request.parse().unwrap();
        let files = descriptor
            .files
            .iter()
            .map(|file| (file.clone(), root.join(&file.spool_name)))
            .collect();
        ExecuteJob {
            peer: PeerName::new("hub").unwrap(),
            name: "X.hub0000X00002".parse().unwrap(),
            descriptor,
            workdir: root.join("work"),
            files,
        }
    }

    #[tokio::test]
    async fn test_unlisted_command_refused() {
        let run = setup(&["cat"]);
        let job = job(&run.root, "U alice hub\nC rm -rf work\n");
        assert_eq!(run.runner.run(&job).await.unwrap(), RunOutcome::Refused);
        assert!(run.root.join("work").is_dir());
    }

    #[tokio::test]
    async fn test_input_feeds_kept_output() {
        let run = setup(&["cat"]);
        let job = job(&run.root, &format!("U alice hub\nF {DATA}\nI {DATA}\nO reply\nC cat\n"));
        assert_eq!(run.runner.run(&job).await.unwrap(), RunOutcome::Succeeded);
        let kept = run.root.join(".Output").join("hub").join("reply");
        assert_eq!(std::fs::read(kept).unwrap(), b"hello\n");
    }

    #[tokio::test]
    async fn test_output_outside_output_area_refused() {
        let run = setup(&["cat"]);
        let victim = run.root.join("victim");
        std::fs::write(&victim, b"keep me").unwrap();

        for target in [victim.display().to_string(), "../victim".to_string(), "..".to_string()] {
            let job = job(&run.root, &format!("U alice hub\nF {DATA}\nI {DATA}\nO {target}\nC cat\n"));
            assert_eq!(run.runner.run(&job).await.unwrap(), RunOutcome::Refused, "{target}");
        }
        assert_eq!(std::fs::read(&victim).unwrap(), b"keep me");
        assert!(!run.root.join(".Output").exists());
    }

    #[tokio::test]
    async fn test_local_names_stay_in_workdir() {
        let run = setup(&["true"]);
        let mut job = job(&run.root, "U alice hub\nC true\n");
        for local in ["letter", "../escaped", ".hidden"] {
            job.files.push((
                RequiredFile {
                    spool_name: DATA.to_string(),
                    local_name: Some(local.to_string()),
                },
                run.root.join(DATA),
            ));
        }
        assert_eq!(run.runner.run(&job).await.unwrap(), RunOutcome::Succeeded);
        assert_eq!(std::fs::read(run.root.join("work").join("letter")).unwrap(), b"hello\n");
        assert!(!run.root.join("escaped").exists());
        assert!(!run.root.join("work").join(".hidden").exists());
    }

    #[tokio::test]
    async fn test_missing_input_is_an_error() {
        let run = setup(&["cat"]);
        let job = job(&run.root, "U alice hub\nI D.hub0000X00009\nC cat\n");
        assert!(run.runner.run(&job).await.is_err());
    }
}
