//! Per-peer status ledger.

use std::time::Duration;

use spoolman_core::{PeerName, Status};
use tokio::fs;
use tracing::{debug, warn};

use crate::counter::PersistentCounter;
use crate::fsutil::{list_names, read_json, write_atomic};
use crate::layout::SpoolLayout;
use crate::{Result, StorageError};

/// Last-contact records, one file per peer under `.Status/`.
///
/// The ledger takes no locks of its own. Writers must hold the peer's
/// [`crate::SystemLock`]; that is what keeps two sessions from interleaving
/// their updates.
#[derive(Debug, Clone)]
pub struct StatusLedger {
    layout: SpoolLayout,
    stale_after: Duration,
}

impl StatusLedger {
    /// Ledger over the given spool.
    pub fn new(layout: SpoolLayout, stale_after: Duration) -> Self {
        Self { layout, stale_after }
    }

    /// Status of `peer`, `None` if it was never contacted.
    pub async fn read(&self, peer: &PeerName) -> Result<Option<Status>> {
        match read_json(&self.layout.status_dir().join(peer.as_str())).await {
            Err(StorageError::Json(e)) => Err(StorageError::corrupt(peer, ".Status", e)),
            other => other,
        }
    }

    /// Record the outcome of a contact attempt. The caller holds the
    /// peer's system lock.
    pub async fn write(&self, peer: &PeerName, status: &Status) -> Result<()> {
        fs::create_dir_all(self.layout.status_dir()).await?;
        write_atomic(
            &self.layout.status_dir().join(peer.as_str()),
            &serde_json::to_vec_pretty(status)?,
        )
        .await?;
        debug!(peer = %peer, kind = %status.kind, retries = status.retries, "status written");
        Ok(())
    }

    /// Every peer with a readable status record, sorted by peer.
    pub async fn read_all(&self) -> Result<Vec<(PeerName, Status)>> {
        let mut names = list_names(&self.layout.status_dir()).await?;
        names.sort();
        let mut all = Vec::new();
        for name in names {
            let Ok(peer) = PeerName::new(&name) else {
                continue;
            };
            match self.read(&peer).await {
                Ok(Some(status)) => all.push((peer, status)),
                Ok(None) => {}
                Err(StorageError::Corrupt { reason, .. }) => {
                    warn!(peer = %peer, %reason, "skipping unreadable status record");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(all)
    }

    /// Next conversation sequence number with `peer`, starting at 1.
    pub async fn next_conversation(&self, peer: &PeerName) -> Result<u64> {
        let dir = self.layout.sequence_dir().join(".conv");
        fs::create_dir_all(&dir).await?;
        let counter = PersistentCounter::new(dir.join(peer.as_str()), self.stale_after);
        Ok(counter.reserve(1).await? + 1)
    }
}
