//! Command entry format.
//!
//! A submitted batch is one directory under `<peer>/C./`, named by its
//! command artifact name. It holds a `job.json` manifest and one
//! `<index>.json` record per command that has not been retired yet. The
//! directory only appears under its final name once every file in it is
//! written, which is what makes a batch visible all at once.

use std::path::Path;

use serde::{Deserialize, Serialize};
use spoolman_core::{Grade, PeerName, Time};
use tokio::fs;
use tracing::debug;

use crate::fsutil::{list_names, read_json, remove_if_exists};
use crate::Result;

/// File name of the batch manifest.
pub const MANIFEST: &str = "job.json";

/// Metadata for a queued batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryManifest {
    /// Peer the batch is queued for
    pub peer: PeerName,
    /// Grade it was submitted at
    pub grade: Grade,
    /// Submitting user
    pub submitter: String,
    /// Submission time, moved forward by renewal
    pub queued_at: Time,
    /// Number of commands originally submitted
    pub commands: usize,
}

/// File name of command record `index`.
pub fn record_name(index: usize) -> String {
    format!("{index}.json")
}

fn record_index(name: &str) -> Option<usize> {
    name.strip_suffix(".json")?.parse().ok()
}

/// Read the manifest of an entry, `None` if the entry is gone.
pub async fn load_manifest(dir: &Path) -> Result<Option<EntryManifest>> {
    read_json(&dir.join(MANIFEST)).await
}

/// Indices of the command records still present, ascending.
pub async fn record_indices(dir: &Path) -> Result<Vec<usize>> {
    let mut indices: Vec<usize> = list_names(dir)
        .await?
        .iter()
        .filter_map(|name| record_index(name))
        .collect();
    indices.sort_unstable();
    Ok(indices)
}

/// Remove an entry directory once its last command record is gone.
///
/// Tolerates the entry vanishing underneath (cancelled concurrently) and a
/// record reappearing is impossible, so a non-empty directory just means
/// work remains.
pub async fn retire_if_empty(dir: &Path) -> Result<bool> {
    if !record_indices(dir).await?.is_empty() {
        return Ok(false);
    }
    remove_if_exists(&dir.join(MANIFEST)).await?;
    match fs::remove_dir(dir).await {
        Ok(()) => {
            debug!(entry = %dir.display(), "command entry retired");
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::DirectoryNotEmpty => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_index_ignores_other_files() {
        assert_eq!(record_index("3.json"), Some(3));
        assert_eq!(record_index(MANIFEST), None);
        assert_eq!(record_index(".3.json.tmp"), None);
    }
}
