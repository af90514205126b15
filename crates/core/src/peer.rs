//! Remote peer names.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ModelError, Result};

/// Longest peer name accepted as a spool directory.
pub const MAX_PEER_NAME_LEN: usize = 64;

/// Width of the peer-derived component embedded in artifact names.
pub const PEER_COMPONENT_LEN: usize = 7;

/// Name of a remote system this installation exchanges jobs with.
///
/// Peer names double as directory names, so they are restricted to ASCII
/// alphanumerics plus `-`, `_` and `.`, and must start with an alphanumeric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerName(String);

impl PeerName {
    /// Validate and wrap a peer name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let reason = if name.is_empty() {
            Some("empty")
        } else if name.len() > MAX_PEER_NAME_LEN {
            Some("too long")
        } else if !name.as_bytes()[0].is_ascii_alphanumeric() {
            Some("must start with a letter or digit")
        } else if !name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        {
            Some("only letters, digits, '-', '_' and '.' are allowed")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(ModelError::InvalidPeerName { name, reason }),
            None => Ok(Self(name)),
        }
    }

    /// The peer name as given.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fixed-width component used inside artifact names.
    ///
    /// Keeps the first seven alphanumerics and pads with `'0'`.
    pub fn component(&self) -> String {
        let mut component: String = self
            .0
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(PEER_COMPONENT_LEN)
            .collect();
        while component.len() < PEER_COMPONENT_LEN {
            component.push('0');
        }
        component
    }
}

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerName {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for PeerName {
    type Error = ModelError;

    fn try_from(s: String) -> Result<Self> {
        Self::new(s)
    }
}

impl From<PeerName> for String {
    fn from(peer: PeerName) -> String {
        peer.0
    }
}

impl AsRef<str> for PeerName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
