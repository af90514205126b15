//! Spool writer: durable batch submission and inbound receive files.
//!
//! A batch is assembled in a hidden staging directory next to the queue and
//! renamed into place once every record and the manifest are written. The
//! scanner skips hidden names, so the rename is the single moment the whole
//! batch becomes visible. Data payloads are copied into temp files first;
//! if anything fails before the rename, those files and the staging
//! directory are removed before the error is returned.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use spoolman_core::{ArtifactKind, ArtifactName, Command, CommandKind, Grade, JobId, PeerName};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::entry::{self, EntryManifest, MANIFEST};
use crate::layout::SpoolLayout;
use crate::naming::NameAllocator;
use crate::{Result, StorageError};

/// Data carried alongside a command.
#[derive(Debug, Clone, Default)]
pub enum Payload {
    /// No local data (receives, or sends of files read in place)
    #[default]
    None,
    /// Bytes to copy into the spool
    Bytes(Vec<u8>),
    /// Local file to copy into the spool
    File(PathBuf),
}

/// One command to submit, with the data it sends.
#[derive(Debug, Clone)]
pub struct SpoolRequest {
    /// The command
    pub command: Command,
    /// Its payload
    pub payload: Payload,
}

impl SpoolRequest {
    /// A command without payload.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            payload: Payload::None,
        }
    }

    /// Copy `bytes` into the spool for this command.
    pub fn with_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.payload = Payload::Bytes(bytes.into());
        self
    }

    /// Copy the file at `path` into the spool for this command.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.payload = Payload::File(path.into());
        self
    }
}

/// Persists batches of commands for a peer.
#[derive(Debug, Clone)]
pub struct SpoolWriter {
    layout: SpoolLayout,
    names: Arc<NameAllocator>,
}

impl SpoolWriter {
    /// Writer drawing names from `names`.
    pub fn new(layout: SpoolLayout, names: Arc<NameAllocator>) -> Self {
        Self { layout, names }
    }

    /// Queue `requests` for `peer` at `grade` as one batch.
    ///
    /// The submitter recorded for the batch is the user of its first command.
    pub async fn submit(&self, peer: &PeerName, grade: Grade, requests: Vec<SpoolRequest>) -> Result<JobId> {
        let Some(first) = requests.first() else {
            return Err(StorageError::EmptyBatch);
        };
        let submitter = first.command.user.clone();

        self.layout.ensure_peer(peer).await?;
        let name = self.names.command_name(peer, grade).await?;
        let job_id = JobId::new(peer.clone(), name.clone())?;
        let staging = self
            .layout
            .command_dir(peer)
            .join(format!(".{}.{}", name, ulid::Ulid::new()));

        let mut written = Vec::new();
        let result = self
            .stage(peer, grade, &staging, requests, &mut written)
            .await;
        let result = match result {
            Ok(count) => {
                let manifest = EntryManifest {
                    peer: peer.clone(),
                    grade,
                    submitter,
                    queued_at: chrono::Utc::now(),
                    commands: count,
                };
                async {
                    write_synced(&staging.join(MANIFEST), &serde_json::to_vec_pretty(&manifest)?).await?;
                    fs::rename(&staging, self.layout.entry_dir(peer, &name)).await?;
                    Ok::<usize, StorageError>(count)
                }
                .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(count) => {
                info!(peer = %peer, job = %job_id, %grade, commands = count, "batch queued");
                Ok(job_id)
            }
            Err(e) => {
                warn!(peer = %peer, job = %job_id, error = %e, "submission failed, removing partial batch");
                self.discard(&staging, &written).await;
                Err(e)
            }
        }
    }

    /// Write payloads and command records into `staging`. Returns the
    /// number of commands.
    async fn stage(
        &self,
        peer: &PeerName,
        grade: Grade,
        staging: &Path,
        requests: Vec<SpoolRequest>,
        written: &mut Vec<PathBuf>,
    ) -> Result<usize> {
        fs::create_dir(staging).await?;
        let count = requests.len();
        for (index, request) in requests.into_iter().enumerate() {
            let mut command = request.command;
            let temp_grade = if command.kind == CommandKind::Execute {
                Grade::EXECUTE
            } else {
                grade
            };
            match request.payload {
                Payload::None => {}
                Payload::Bytes(bytes) => {
                    let temp = self.names.temp_name(peer, temp_grade).await?;
                    let path = self.layout.artifact_path(peer, &temp);
                    written.push(path.clone());
                    write_synced(&path, &bytes).await?;
                    command.temp = Some(temp);
                }
                Payload::File(source) => {
                    let temp = self.names.temp_name(peer, temp_grade).await?;
                    let path = self.layout.artifact_path(peer, &temp);
                    written.push(path.clone());
                    fs::copy(&source, &path).await?;
                    command.temp = Some(temp);
                }
            }

            let record = serde_json::to_vec_pretty(&command)?;
            write_synced(&staging.join(entry::record_name(index)), &record).await?;
        }
        Ok(count)
    }

    async fn discard(&self, staging: &Path, written: &[PathBuf]) {
        for path in written {
            if let Err(e) = crate::fsutil::remove_if_exists(path).await {
                warn!(path = %path.display(), error = %e, "could not remove partial batch file");
            }
        }
        match fs::remove_dir_all(staging).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %staging.display(), error = %e, "could not remove staging directory"),
        }
    }

    /// Start receiving a file from `peer`.
    ///
    /// The data lands in the spool's temp area until it is committed under
    /// its final name or preserved after a failed transfer.
    pub async fn open_receive(&self, peer: &PeerName) -> Result<InboundFile> {
        let dir = self.layout.temp_dir();
        fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.{}", peer, ulid::Ulid::new()));
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        debug!(peer = %peer, path = %path.display(), "receive started");
        Ok(InboundFile {
            layout: self.layout.clone(),
            peer: peer.clone(),
            path,
            file: Some(file),
            settled: false,
        })
    }
}

/// A file being received from a peer.
///
/// Dropping it without a successful [`InboundFile::commit`] or
/// [`InboundFile::preserve`] leaves the data in the temp area.
#[derive(Debug)]
pub struct InboundFile {
    layout: SpoolLayout,
    peer: PeerName,
    path: PathBuf,
    file: Option<fs::File>,
    settled: bool,
}

impl InboundFile {
    /// Where the data currently is.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append received bytes.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match self.file.as_mut() {
            Some(file) => Ok(file.write_all(buf).await?),
            None => Err(StorageError::NotFound(self.path.display().to_string())),
        }
    }

    /// Move the completed transfer into the peer's spool under `name`.
    ///
    /// Data names go to the data area (or the execute-bound data area for
    /// the execute grade); execute names go to the execute area. A name
    /// that is already taken is refused and the data stays where it is, so
    /// the transfer can still be preserved.
    pub async fn commit(&mut self, name: &ArtifactName) -> Result<PathBuf> {
        if self.settled {
            return Err(StorageError::NotFound(self.path.display().to_string()));
        }
        if name.kind() == ArtifactKind::Command {
            return Err(StorageError::corrupt(
                &self.peer,
                name,
                "command entries are never received as files",
            ));
        }
        self.finish().await?;
        self.layout.ensure_peer(&self.peer).await?;
        let target = self.layout.artifact_path(&self.peer, name);
        // Linking fails on an existing target, unlike rename.
        match fs::hard_link(&self.path, &target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!(peer = %self.peer, artifact = %name, "received file name already in use");
                return Err(StorageError::corrupt(&self.peer, name, "a spool file by that name exists"));
            }
            Err(e) => return Err(e.into()),
        }
        crate::fsutil::remove_if_exists(&self.path).await?;
        info!(peer = %self.peer, artifact = %name, "received file committed");
        self.path = target.clone();
        self.settled = true;
        Ok(target)
    }

    /// Keep a failed transfer's data and report where it went.
    pub async fn preserve(mut self) -> Result<PathBuf> {
        if self.settled {
            return Err(StorageError::NotFound(self.path.display().to_string()));
        }
        self.finish().await?;
        let dir = self.layout.preserve_dir().join(self.peer.as_str());
        fs::create_dir_all(&dir).await?;
        let target = match self.path.file_name() {
            Some(file_name) => dir.join(file_name),
            None => dir.join(ulid::Ulid::new().to_string()),
        };
        fs::rename(&self.path, &target).await?;
        warn!(peer = %self.peer, saved = %target.display(), "failed receive preserved");
        self.path = target.clone();
        self.settled = true;
        Ok(target)
    }

    async fn finish(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

impl Drop for InboundFile {
    fn drop(&mut self) {
        if !self.settled {
            warn!(peer = %self.peer, path = %self.path.display(), "receive abandoned, data left in place");
        }
    }
}

async fn write_synced(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::WorkQueue;
    use std::time::Duration;

    fn setup() -> (tempfile::TempDir, SpoolLayout, SpoolWriter) {
        let dir = tempfile::tempdir().unwrap();
        let layout = SpoolLayout::new(dir.path());
        let names = NameAllocator::new(
            layout.clone(),
            PeerName::new("local").unwrap(),
            Duration::from_secs(60),
        );
        let writer = SpoolWriter::new(layout.clone(), Arc::new(names));
        (dir, layout, writer)
    }

    fn send(i: usize) -> SpoolRequest {
        SpoolRequest::new(Command::send(format!("/src/{i}"), format!("/dst/{i}"), "alice"))
            .with_bytes(format!("payload {i}"))
    }

    #[tokio::test]
    async fn test_batch_visible_as_a_whole() {
        let (_dir, layout, writer) = setup();
        layout.ensure().await.unwrap();
        let hub = PeerName::new("hub").unwrap();
        writer
            .submit(&hub, Grade::DEFAULT, (0..3).map(send).collect())
            .await
            .unwrap();

        let mut cursor = WorkQueue::new(layout.clone())
            .open(&hub, Grade::LOWEST, true)
            .await
            .unwrap();
        let mut seen = Vec::new();
        while let Some(job) = cursor.next().await.unwrap() {
            let temp = job.command.temp.clone().unwrap();
            let data = fs::read(layout.artifact_path(&hub, &temp)).await.unwrap();
            seen.push(String::from_utf8(data).unwrap());
        }
        assert_eq!(seen, vec!["payload 0", "payload 1", "payload 2"]);
    }

    #[tokio::test]
    async fn test_interrupted_batch_is_invisible() {
        let (_dir, layout, writer) = setup();
        layout.ensure().await.unwrap();
        let hub = PeerName::new("hub").unwrap();
        layout.ensure_peer(&hub).await.unwrap();
        // A submitter killed after three of five records: staged, never renamed.
        let staging = layout.command_dir(&hub).join(format!(".C.local0000A{}", ulid::Ulid::new()));
        let mut written = Vec::new();
        let staged = writer
            .stage(&hub, Grade::DEFAULT, &staging, (0..3).map(send).collect(), &mut written)
            .await
            .unwrap();
        assert_eq!(staged, 3);
        assert!(staging.is_dir());

        let queue = WorkQueue::new(layout.clone());
        assert_eq!(queue.has_work(&hub).await.unwrap(), None);
        let mut cursor = queue.open(&hub, Grade::LOWEST, true).await.unwrap();
        assert!(cursor.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_batch_cleans_up() {
        let (_dir, layout, writer) = setup();
        layout.ensure().await.unwrap();
        let hub = PeerName::new("hub").unwrap();
        let requests = vec![
            send(0),
            SpoolRequest::new(Command::send("/missing", "/dst", "alice")).with_file("/definitely/not/here"),
        ];
        assert!(writer.submit(&hub, Grade::DEFAULT, requests).await.is_err());

        let data = crate::fsutil::list_names(&layout.data_dir(&hub, Grade::DEFAULT))
            .await
            .unwrap();
        assert!(data.is_empty(), "left behind: {data:?}");
        let entries = crate::fsutil::list_names(&layout.command_dir(&hub)).await.unwrap();
        assert!(entries.is_empty(), "left behind: {entries:?}");
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let (_dir, _layout, writer) = setup();
        let hub = PeerName::new("hub").unwrap();
        assert!(matches!(
            writer.submit(&hub, Grade::DEFAULT, Vec::new()).await,
            Err(StorageError::EmptyBatch)
        ));
    }

    #[tokio::test]
    async fn test_execute_payload_uses_execute_grade() {
        let (_dir, layout, writer) = setup();
        layout.ensure().await.unwrap();
        let hub = PeerName::new("hub").unwrap();
        let request = SpoolRequest::new(Command::execute("D.local0X00001", "X.local0X00001", "alice"))
            .with_bytes("U alice local\nC rmail bob\n");
        writer.submit(&hub, Grade::DEFAULT, vec![request]).await.unwrap();

        let names = crate::fsutil::list_names(&layout.data_dir(&hub, Grade::EXECUTE))
            .await
            .unwrap();
        assert_eq!(names.len(), 1);
        let name: ArtifactName = names[0].parse().unwrap();
        assert_eq!(name.grade(), Grade::EXECUTE);
    }

    #[tokio::test]
    async fn test_receive_commit_and_preserve() {
        let (_dir, layout, writer) = setup();
        layout.ensure().await.unwrap();
        let hub = PeerName::new("hub").unwrap();

        let mut inbound = writer.open_receive(&hub).await.unwrap();
        inbound.write_all(b"hello").await.unwrap();
        let name: ArtifactName = "D.hub0000N00007".parse().unwrap();
        let at = inbound.commit(&name).await.unwrap();
        drop(inbound);
        assert_eq!(at, layout.artifact_path(&hub, &name));
        assert_eq!(fs::read(&at).await.unwrap(), b"hello");

        let mut failed = writer.open_receive(&hub).await.unwrap();
        failed.write_all(b"partial").await.unwrap();
        let saved = failed.preserve().await.unwrap();
        assert!(saved.starts_with(layout.preserve_dir()));
        assert_eq!(fs::read(&saved).await.unwrap(), b"partial");
    }

    #[tokio::test]
    async fn test_commit_never_replaces_existing_file() {
        let (_dir, layout, writer) = setup();
        layout.ensure().await.unwrap();
        let hub = PeerName::new("hub").unwrap();
        let name: ArtifactName = "D.hub0000N00007".parse().unwrap();

        let mut first = writer.open_receive(&hub).await.unwrap();
        first.write_all(b"first").await.unwrap();
        let at = first.commit(&name).await.unwrap();

        let mut second = writer.open_receive(&hub).await.unwrap();
        second.write_all(b"second").await.unwrap();
        let err = second.commit(&name).await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
        assert_eq!(fs::read(&at).await.unwrap(), b"first");
        assert!(second.path().starts_with(layout.temp_dir()));

        let saved = second.preserve().await.unwrap();
        assert_eq!(fs::read(&saved).await.unwrap(), b"second");
        assert!(first.commit(&name).await.is_err());
    }
}
