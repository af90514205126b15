//! Execute file enumeration.

use std::path::PathBuf;

use spoolman_core::{ArtifactKind, ArtifactName, PeerName};
use spoolman_storage::fsutil::list_names;
use spoolman_storage::{Result, SpoolLayout};
use tracing::{trace, warn};

/// An execute file waiting to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedExecute {
    /// Peer the request came from
    pub peer: PeerName,
    /// Execute file name
    pub name: ArtifactName,
    /// Where it is
    pub path: PathBuf,
}

/// Finds execute files across every peer's spool.
#[derive(Debug, Clone)]
pub struct ExecuteScanner {
    layout: SpoolLayout,
}

impl ExecuteScanner {
    /// Scanner over the given spool.
    pub fn new(layout: SpoolLayout) -> Self {
        Self { layout }
    }

    /// Every execute file, by peer then sequence.
    ///
    /// Hidden names are files still being received and are skipped; other
    /// names that are not execute artifact names are logged and skipped.
    pub async fn scan(&self) -> Result<Vec<QueuedExecute>> {
        let mut found = Vec::new();
        for peer in self.layout.peers().await? {
            let dir = self.layout.execute_dir(&peer);
            let mut names = Vec::new();
            for raw in list_names(&dir).await? {
                if raw.starts_with('.') {
                    continue;
                }
                match raw.parse::<ArtifactName>() {
                    Ok(name) if name.kind() == ArtifactKind::Execute => names.push(name),
                    Ok(_) => warn!(peer = %peer, name = %raw, "non-execute file in execute directory, skipping"),
                    Err(e) => warn!(peer = %peer, name = %raw, error = %e, "malformed execute file name, skipping"),
                }
            }
            names.sort_by(|a, b| a.sequence().cmp(&b.sequence()).then(a.cmp(b)));
            trace!(peer = %peer, count = names.len(), "execute files found");
            found.extend(names.into_iter().map(|name| QueuedExecute {
                path: dir.join(name.as_str()),
                peer: peer.clone(),
                name,
            }));
        }
        Ok(found)
    }
}
