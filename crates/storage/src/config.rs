//! Spool configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use spoolman_core::{PeerName, RetryPolicy};

use crate::{Result, StorageError};

/// Settings for one spool installation, read from TOML.
///
/// Every field has a default, so an empty file is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    /// Root of the spool tree
    pub spool_dir: PathBuf,
    /// This node's name, embedded in peer-visible data and execute names
    pub local_name: String,
    /// Ceiling on concurrently admitted execution workers (0 = unlimited)
    pub max_xqts: usize,
    /// Age after which an internal counter lock is presumed abandoned
    pub stale_lock_secs: u64,
    /// Users allowed to cancel or renew other users' jobs
    pub privileged_users: Vec<String>,
    /// Commands remote peers may execute here
    pub allowed_commands: Vec<String>,
    /// Retry backoff thresholds
    pub retry: RetryPolicy,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            spool_dir: PathBuf::from("/var/spool/spoolman"),
            local_name: "localhost".to_string(),
            max_xqts: 0,
            stale_lock_secs: 60,
            privileged_users: vec!["root".to_string()],
            allowed_commands: vec!["rmail".to_string(), "rnews".to_string()],
            retry: RetryPolicy::default(),
        }
    }
}

impl SpoolConfig {
    /// Defaults rooted at `spool_dir`.
    pub fn with_spool_dir(spool_dir: impl Into<PathBuf>) -> Self {
        Self {
            spool_dir: spool_dir.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| StorageError::Config(e.to_string()))
    }

    /// Load from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StorageError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// This node's name as a peer name.
    pub fn local_peer(&self) -> Result<PeerName> {
        Ok(PeerName::new(self.local_name.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = SpoolConfig::from_toml("").unwrap();
        assert_eq!(config.max_xqts, 0);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.allowed_commands, vec!["rmail", "rnews"]);
    }

    #[test]
    fn test_partial_document() {
        let config = SpoolConfig::from_toml(
            r#"
            spool_dir = "/tmp/spool"
            local_name = "relay"
            max_xqts = 4

            [retry]
            base_wait_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.spool_dir, PathBuf::from("/tmp/spool"));
        assert_eq!(config.local_peer().unwrap().as_str(), "relay");
        assert_eq!(config.max_xqts, 4);
        assert_eq!(config.retry.base_wait_secs, 30);
        assert_eq!(config.retry.max_retries, RetryPolicy::default().max_retries);
    }

    #[test]
    fn test_rejects_bad_types() {
        assert!(matches!(
            SpoolConfig::from_toml("max_xqts = \"many\""),
            Err(StorageError::Config(_))
        ));
    }
}
