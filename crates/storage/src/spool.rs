//! One handle over every spool component.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::SpoolConfig;
use crate::layout::SpoolLayout;
use crate::lock::SystemLock;
use crate::naming::NameAllocator;
use crate::queue::WorkQueue;
use crate::registry::{JobRegistry, PrivilegedUsers};
use crate::status::StatusLedger;
use crate::writer::SpoolWriter;
use crate::Result;

/// An opened spool. Components share the layout and name allocator.
#[derive(Debug, Clone)]
pub struct Spool {
    config: SpoolConfig,
    layout: SpoolLayout,
    names: Arc<NameAllocator>,
}

impl Spool {
    /// Open the spool described by `config`, creating its directories.
    pub async fn open(config: &SpoolConfig) -> Result<Self> {
        let layout = SpoolLayout::new(&config.spool_dir);
        layout.ensure().await?;
        let names = NameAllocator::new(layout.clone(), config.local_peer()?, stale_after(config));
        info!(spool = %config.spool_dir.display(), local = %config.local_name, "spool opened");
        Ok(Self {
            config: config.clone(),
            layout,
            names: Arc::new(names),
        })
    }

    /// Configuration it was opened with.
    pub fn config(&self) -> &SpoolConfig {
        &self.config
    }

    /// Path resolver.
    pub fn layout(&self) -> &SpoolLayout {
        &self.layout
    }

    /// Name allocator.
    pub fn names(&self) -> &Arc<NameAllocator> {
        &self.names
    }

    /// Batch submission and inbound files.
    pub fn writer(&self) -> SpoolWriter {
        SpoolWriter::new(self.layout.clone(), Arc::clone(&self.names))
    }

    /// Queue scanning.
    pub fn queue(&self) -> WorkQueue {
        WorkQueue::new(self.layout.clone())
    }

    /// Job lookup, cancel and renew.
    pub fn registry(&self) -> JobRegistry {
        JobRegistry::new(self.layout.clone())
    }

    /// Session locks.
    pub fn system_lock(&self) -> SystemLock {
        SystemLock::new(self.layout.clone())
    }

    /// Status records.
    pub fn status(&self) -> StatusLedger {
        StatusLedger::new(self.layout.clone(), stale_after(&self.config))
    }

    /// Users configured as privileged.
    pub fn authorizer(&self) -> PrivilegedUsers {
        PrivilegedUsers::new(self.config.privileged_users.iter().cloned())
    }
}

fn stale_after(config: &SpoolConfig) -> Duration {
    Duration::from_secs(config.stale_lock_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Authorizer;
    use crate::writer::SpoolRequest;
    use spoolman_core::{Command, Grade, PeerName};

    #[tokio::test]
    async fn test_open_and_submit() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SpoolConfig::with_spool_dir(dir.path());
        config.local_name = "gateway".to_string();
        let spool = Spool::open(&config).await.unwrap();
        assert!(spool.layout().locks_dir().is_dir());
        assert!(spool.authorizer().is_privileged("root"));

        let hub = PeerName::new("hub").unwrap();
        let id = spool
            .writer()
            .submit(&hub, Grade::DEFAULT, vec![SpoolRequest::new(Command::receive("/r", "/l", "bob"))])
            .await
            .unwrap();
        assert_eq!(spool.queue().has_work(&hub).await.unwrap(), Some(Grade::DEFAULT));
        assert_eq!(spool.registry().resolve(&id).await.unwrap().submitter, "bob");
    }

    #[tokio::test]
    async fn test_invalid_local_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SpoolConfig::with_spool_dir(dir.path());
        config.local_name = "bad name".to_string();
        assert!(Spool::open(&config).await.is_err());
    }
}
