//! On-disk layout of the spool tree.
//!
//! ```text
//! <root>/
//!   .Locks/          lock records (LCK..<peer>, LXQ.<n>, LXQ.cmd.<cmd>, LXF.*, LXQ.dir)
//!   .Status/<peer>   last-contact status
//!   .Sequence/       persisted name and conversation counters
//!   .Preserve/       temp files saved after failed transfers
//!   .Temp/           inbound files in flight, cancelled entries being removed
//!   .Xqtdir/         execution working directory
//!   .Output/<peer>/  standard output of executions that asked to keep it
//!   <peer>/C./       command entries (one directory per batch)
//!   <peer>/D./       temp and data files
//!   <peer>/D.X/      data files that will become execute files
//!   <peer>/X./       execute files waiting to run
//! ```

use std::path::{Path, PathBuf};

use spoolman_core::{ArtifactKind, ArtifactName, Grade, PeerName};
use tokio::fs;
use tracing::debug;

use crate::Result;

/// Resolves spool paths. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SpoolLayout {
    root: PathBuf,
}

impl SpoolLayout {
    /// Layout rooted at `root`. Nothing is created.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the shared top-level directories.
    pub async fn ensure(&self) -> Result<()> {
        for dir in [
            self.locks_dir(),
            self.status_dir(),
            self.sequence_dir(),
            self.preserve_dir(),
            self.temp_dir(),
            self.xqt_dir(),
            self.output_dir(),
        ] {
            fs::create_dir_all(dir).await?;
        }
        debug!(root = %self.root.display(), "spool layout ready");
        Ok(())
    }

    /// Create the per-peer directories.
    pub async fn ensure_peer(&self, peer: &PeerName) -> Result<()> {
        fs::create_dir_all(self.command_dir(peer)).await?;
        fs::create_dir_all(self.data_dir(peer, Grade::DEFAULT)).await?;
        fs::create_dir_all(self.data_dir(peer, Grade::EXECUTE)).await?;
        fs::create_dir_all(self.execute_dir(peer)).await?;
        Ok(())
    }

    /// Spool root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn peer_dir(&self, peer: &PeerName) -> PathBuf {
        self.root.join(peer.as_str())
    }

    /// Directory holding a peer's command entries.
    pub fn command_dir(&self, peer: &PeerName) -> PathBuf {
        self.peer_dir(peer).join("C.")
    }

    /// Directory of one command entry.
    pub fn entry_dir(&self, peer: &PeerName, name: &ArtifactName) -> PathBuf {
        self.command_dir(peer).join(name.as_str())
    }

    /// Data directory for files of `grade`; the execute grade has its own.
    pub fn data_dir(&self, peer: &PeerName, grade: Grade) -> PathBuf {
        if grade == Grade::EXECUTE {
            self.peer_dir(peer).join("D.X")
        } else {
            self.peer_dir(peer).join("D.")
        }
    }

    /// Directory of execute files received from a peer.
    pub fn execute_dir(&self, peer: &PeerName) -> PathBuf {
        self.peer_dir(peer).join("X.")
    }

    /// Where an artifact of a peer lives.
    pub fn artifact_path(&self, peer: &PeerName, name: &ArtifactName) -> PathBuf {
        match name.kind() {
            ArtifactKind::Command => self.entry_dir(peer, name),
            ArtifactKind::Data => self.data_dir(peer, name.grade()).join(name.as_str()),
            ArtifactKind::Execute => self.execute_dir(peer).join(name.as_str()),
        }
    }

    /// Lock records.
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join(".Locks")
    }

    /// Session lock record for a peer.
    pub fn system_lock(&self, peer: &PeerName) -> PathBuf {
        self.locks_dir().join(format!("LCK..{}", peer))
    }

    /// Status records.
    pub fn status_dir(&self) -> PathBuf {
        self.root.join(".Status")
    }

    /// Persisted counters.
    pub fn sequence_dir(&self) -> PathBuf {
        self.root.join(".Sequence")
    }

    /// Saved temp files.
    pub fn preserve_dir(&self) -> PathBuf {
        self.root.join(".Preserve")
    }

    /// In-flight files.
    pub fn temp_dir(&self) -> PathBuf {
        self.root.join(".Temp")
    }

    /// Execution working directory.
    pub fn xqt_dir(&self) -> PathBuf {
        self.root.join(".Xqtdir")
    }

    /// Kept standard output of executions.
    pub fn output_dir(&self) -> PathBuf {
        self.root.join(".Output")
    }

    /// Every peer that has a spool directory, sorted by name.
    pub async fn peers(&self) -> Result<Vec<PeerName>> {
        let mut peers = Vec::new();
        let mut rd = match fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(peers),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = rd.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Ok(peer) = PeerName::new(name) {
                peers.push(peer);
            }
        }
        peers.sort();
        Ok(peers)
    }
}
