//! Job identifiers and in-process sequence tokens.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::artifact::{ArtifactKind, ArtifactName};
use crate::error::{ModelError, Result};
use crate::peer::PeerName;

/// Durable, printable handle to a queued job.
///
/// Rendered as `<peer>.<grade><sequence>`, e.g. `gateway.C0001a`. Any process
/// can resolve it back to the command entry it was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId {
    peer: PeerName,
    command: ArtifactName,
}

impl JobId {
    /// Derive the identifier of a command entry queued for `peer`.
    pub fn new(peer: PeerName, command: ArtifactName) -> Result<Self> {
        if command.kind() != ArtifactKind::Command || command.component() != peer.component() {
            return Err(ModelError::InvalidJobId(format!("{}.{}", peer, command)));
        }
        Ok(Self { peer, command })
    }

    /// Peer the job is queued for.
    pub fn peer(&self) -> &PeerName {
        &self.peer
    }

    /// Name of the command entry in the peer's queue.
    pub fn command_name(&self) -> &ArtifactName {
        &self.command
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.peer, self.command.suffix())
    }
}

impl FromStr for JobId {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ModelError::InvalidJobId(s.to_string());
        let (peer, suffix) = s.rsplit_once('.').ok_or_else(invalid)?;
        let peer = PeerName::new(peer).map_err(|_| invalid())?;
        let command = format!("C.{}{}", peer.component(), suffix)
            .parse::<ArtifactName>()
            .map_err(|_| invalid())?;
        Ok(Self { peer, command })
    }
}

impl TryFrom<String> for JobId {
    type Error = ModelError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> String {
        id.to_string()
    }
}

/// Ephemeral handle to a job enumerated by one work cursor.
///
/// Only meaningful to the cursor that issued it, inside the process that
/// opened that cursor. It is deliberately not serializable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SequenceToken {
    cursor: u64,
    index: usize,
}

impl SequenceToken {
    /// Create a token for slot `index` of cursor `cursor`.
    pub fn new(cursor: u64, index: usize) -> Self {
        Self { cursor, index }
    }

    /// Identifier of the issuing cursor.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Slot in the issuing cursor's arena.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for SequenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.cursor, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_derives_from_command_name() {
        let peer = PeerName::new("gateway.example").unwrap();
        let command: ArtifactName = "C.gatewayC0001a".parse().unwrap();
        let id = JobId::new(peer.clone(), command.clone()).unwrap();
        assert_eq!(id.to_string(), "gateway.example.C0001a");

        let parsed: JobId = "gateway.example.C0001a".parse().unwrap();
        assert_eq!(parsed.peer(), &peer);
        assert_eq!(parsed.command_name(), &command);
    }

    #[test]
    fn test_job_id_rejects_foreign_entries() {
        let peer = PeerName::new("gateway").unwrap();
        let data: ArtifactName = "D.gatewayC0001a".parse().unwrap();
        assert!(JobId::new(peer.clone(), data).is_err());
        let other: ArtifactName = "C.otherhsC0001a".parse().unwrap();
        assert!(JobId::new(peer, other).is_err());
        assert!("nodot".parse::<JobId>().is_err());
        assert!("gateway.C01".parse::<JobId>().is_err());
    }
}
