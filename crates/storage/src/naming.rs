//! Naming scheme for temporary, data, command and execute artifacts.
//!
//! Names combine a peer component, the grade and a per-peer counter that is
//! persisted under `.Sequence/`, so a name is never handed out twice for the
//! same peer, including across process restarts. Values are reserved from
//! the counter in blocks; a block cut short by an exit is simply skipped.

use std::collections::HashMap;
use std::ops::Range;
use std::time::Duration;

use spoolman_core::{ArtifactKind, ArtifactName, Grade, PeerName, SEQUENCE_SPACE};
use tokio::sync::Mutex;
use tracing::trace;

use crate::counter::PersistentCounter;
use crate::layout::SpoolLayout;
use crate::Result;

const RESERVE_BLOCK: u64 = 32;

/// Names sharing one sequence value, for a file that is sent and then
/// executed on the other side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameSet {
    /// Local temporary name holding the data until it is sent
    pub temp: ArtifactName,
    /// Name the data gets in the peer's spool
    pub data: ArtifactName,
    /// Name of the execute file in the peer's spool
    pub execute: ArtifactName,
}

/// Allocates artifact names.
#[derive(Debug)]
pub struct NameAllocator {
    layout: SpoolLayout,
    local: PeerName,
    stale_after: Duration,
    reserved: Mutex<HashMap<PeerName, Range<u64>>>,
}

impl NameAllocator {
    /// Allocator for a spool whose own node is `local`.
    pub fn new(layout: SpoolLayout, local: PeerName, stale_after: Duration) -> Self {
        Self {
            layout,
            local,
            stale_after,
            reserved: Mutex::new(HashMap::new()),
        }
    }

    /// This node's name.
    pub fn local(&self) -> &PeerName {
        &self.local
    }

    /// Temporary file name for data queued to `peer`.
    pub async fn temp_name(&self, peer: &PeerName, grade: Grade) -> Result<ArtifactName> {
        let seq = self.next(peer).await?;
        Ok(ArtifactName::new(ArtifactKind::Data, &peer.component(), grade, seq)?)
    }

    /// Data file name that is unique inside `peer`'s inbound spool.
    pub async fn data_name(&self, peer: &PeerName, grade: Grade) -> Result<ArtifactName> {
        let seq = self.next(peer).await?;
        Ok(ArtifactName::new(ArtifactKind::Data, &self.local.component(), grade, seq)?)
    }

    /// Name for a local execute file.
    pub async fn execute_name(&self) -> Result<ArtifactName> {
        let seq = self.next(&self.local).await?;
        Ok(ArtifactName::new(
            ArtifactKind::Execute,
            &self.local.component(),
            Grade::EXECUTE,
            seq,
        )?)
    }

    /// Name for a command entry queued to `peer`.
    pub async fn command_name(&self, peer: &PeerName, grade: Grade) -> Result<ArtifactName> {
        let seq = self.next(peer).await?;
        Ok(ArtifactName::new(ArtifactKind::Command, &peer.component(), grade, seq)?)
    }

    /// Temp, data and execute names drawn from a single sequence value.
    pub async fn name_set(&self, peer: &PeerName, grade: Grade) -> Result<NameSet> {
        let seq = self.next(peer).await?;
        let local = self.local.component();
        Ok(NameSet {
            temp: ArtifactName::new(ArtifactKind::Data, &peer.component(), grade, seq)?,
            data: ArtifactName::new(ArtifactKind::Data, &local, grade, seq)?,
            execute: ArtifactName::new(ArtifactKind::Execute, &local, Grade::EXECUTE, seq)?,
        })
    }

    async fn next(&self, peer: &PeerName) -> Result<u64> {
        let mut reserved = self.reserved.lock().await;
        let block = reserved.entry(peer.clone()).or_insert(0..0);
        if block.is_empty() {
            let counter = PersistentCounter::new(
                self.layout.sequence_dir().join(peer.as_str()),
                self.stale_after,
            );
            let start = counter.reserve(RESERVE_BLOCK).await?;
            *block = start..start.wrapping_add(RESERVE_BLOCK);
            trace!(peer = %peer, start, "sequence block reserved");
        }
        let seq = block.start;
        block.start += 1;
        Ok(seq % SEQUENCE_SPACE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spoolman_core::ARTIFACT_NAME_LEN;
    use std::collections::HashSet;

    async fn allocator(layout: &SpoolLayout) -> NameAllocator {
        layout.ensure().await.unwrap();
        NameAllocator::new(
            layout.clone(),
            PeerName::new("localnode").unwrap(),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_names_are_fixed_width() {
        let dir = tempfile::tempdir().unwrap();
        let layout = SpoolLayout::new(dir.path());
        let names = allocator(&layout).await;
        let peer = PeerName::new("hub").unwrap();
        let grade = Grade::new('c').unwrap();

        let temp = names.temp_name(&peer, grade).await.unwrap();
        let data = names.data_name(&peer, grade).await.unwrap();
        let xqt = names.execute_name().await.unwrap();
        for name in [&temp, &data, &xqt] {
            assert_eq!(name.as_str().len(), ARTIFACT_NAME_LEN);
            assert!(name.as_str().chars().all(|c| c.is_ascii_alphanumeric() || c == '.'));
        }
        assert!(temp.as_str().starts_with("D.hub0000c"));
        assert!(data.as_str().starts_with("D.localnoc"));
        assert!(xqt.as_str().starts_with("X.localnoX"));
    }

    #[tokio::test]
    async fn test_name_set_shares_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let layout = SpoolLayout::new(dir.path());
        let names = allocator(&layout).await;
        let set = names
            .name_set(&PeerName::new("hub").unwrap(), Grade::EXECUTE)
            .await
            .unwrap();
        assert_eq!(set.temp.sequence(), set.data.sequence());
        assert_eq!(set.data.sequence(), set.execute.sequence());
    }

    #[tokio::test]
    async fn test_no_duplicates_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let layout = SpoolLayout::new(dir.path());
        let peer = PeerName::new("hub").unwrap();
        let grade = Grade::DEFAULT;
        let mut seen = HashSet::new();

        let first = allocator(&layout).await;
        for _ in 0..5_000 {
            assert!(seen.insert(first.temp_name(&peer, grade).await.unwrap()));
        }
        drop(first);

        // A fresh allocator has no in-memory state; only the persisted counter.
        let second = allocator(&layout).await;
        for _ in 0..5_000 {
            assert!(seen.insert(second.temp_name(&peer, grade).await.unwrap()));
        }
        assert_eq!(seen.len(), 10_000);
    }
}
