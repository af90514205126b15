//! Fixed-width spool artifact names.
//!
//! Every artifact name is exactly [`ARTIFACT_NAME_LEN`] characters:
//!
//! ```text
//! K.ppppppgsssss
//! │ │      │└──── five base-62 sequence digits
//! │ │      └───── grade letter
//! │ └──────────── seven-character peer component
//! └────────────── kind letter ('C', 'D' or 'X') followed by '.'
//! ```
//!
//! Only `[0-9A-Za-z.]` appears in a name.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ModelError, Result};
use crate::grade::Grade;
use crate::peer::PEER_COMPONENT_LEN;

/// Length of every artifact name.
pub const ARTIFACT_NAME_LEN: usize = 15;

/// Number of base-62 digits carrying the sequence.
pub const SEQUENCE_DIGITS: usize = 5;

/// Number of distinct sequence values before names wrap.
pub const SEQUENCE_SPACE: u64 = 62u64.pow(SEQUENCE_DIGITS as u32);

const DIGITS: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// What an artifact holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// A queued batch of commands
    Command,
    /// A temporary or peer-visible data file
    Data,
    /// An execute descriptor
    Execute,
}

impl ArtifactKind {
    /// The leading letter of names of this kind.
    pub fn prefix(self) -> char {
        match self {
            ArtifactKind::Command => 'C',
            ArtifactKind::Data => 'D',
            ArtifactKind::Execute => 'X',
        }
    }

    fn from_prefix(c: char) -> Option<Self> {
        match c {
            'C' => Some(ArtifactKind::Command),
            'D' => Some(ArtifactKind::Data),
            'X' => Some(ArtifactKind::Execute),
            _ => None,
        }
    }
}

/// A validated artifact name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactName(String);

impl ArtifactName {
    /// Build a name from its parts. `sequence` is reduced modulo
    /// [`SEQUENCE_SPACE`].
    pub fn new(kind: ArtifactKind, component: &str, grade: Grade, sequence: u64) -> Result<Self> {
        let mut name = String::with_capacity(ARTIFACT_NAME_LEN);
        name.push(kind.prefix());
        name.push('.');
        name.push_str(component);
        name.push(grade.as_char());
        name.push_str(&encode_sequence(sequence));
        name.parse()
    }

    /// The name as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Kind encoded in the first letter.
    pub fn kind(&self) -> ArtifactKind {
        // Validated at construction.
        ArtifactKind::from_prefix(self.0.as_bytes()[0] as char).unwrap_or(ArtifactKind::Data)
    }

    /// The seven-character peer component.
    pub fn component(&self) -> &str {
        &self.0[2..2 + PEER_COMPONENT_LEN]
    }

    /// Grade embedded in the name.
    pub fn grade(&self) -> Grade {
        let c = self.0.as_bytes()[2 + PEER_COMPONENT_LEN] as char;
        Grade::new(c).unwrap_or(Grade::DEFAULT)
    }

    /// The grade and sequence suffix, as used in job identifiers.
    pub fn suffix(&self) -> &str {
        &self.0[2 + PEER_COMPONENT_LEN..]
    }

    /// Decoded sequence number.
    pub fn sequence(&self) -> u64 {
        decode_sequence(&self.0[ARTIFACT_NAME_LEN - SEQUENCE_DIGITS..]).unwrap_or(0)
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ArtifactName {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason| ModelError::InvalidArtifactName {
            name: s.to_string(),
            reason,
        };

        if s.len() != ARTIFACT_NAME_LEN || !s.is_ascii() {
            return Err(invalid("must be 15 ASCII characters"));
        }
        let bytes = s.as_bytes();
        if ArtifactKind::from_prefix(bytes[0] as char).is_none() || bytes[1] != b'.' {
            return Err(invalid("must start with 'C.', 'D.' or 'X.'"));
        }
        if !bytes[2..].iter().all(|b| b.is_ascii_alphanumeric()) {
            return Err(invalid("contains characters outside [0-9A-Za-z]"));
        }
        if !bytes[2 + PEER_COMPONENT_LEN].is_ascii_alphabetic() {
            return Err(invalid("grade position is not a letter"));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for ArtifactName {
    type Error = ModelError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ArtifactName> for String {
    fn from(name: ArtifactName) -> String {
        name.0
    }
}

/// Render a sequence as five base-62 digits.
pub fn encode_sequence(sequence: u64) -> String {
    let mut n = sequence % SEQUENCE_SPACE;
    let mut out = [b'0'; SEQUENCE_DIGITS];
    for slot in out.iter_mut().rev() {
        *slot = DIGITS[(n % 62) as usize];
        n /= 62;
    }
    out.iter().map(|&b| b as char).collect()
}

/// Parse five base-62 digits back into a sequence.
pub fn decode_sequence(digits: &str) -> Option<u64> {
    if digits.len() != SEQUENCE_DIGITS {
        return None;
    }
    digits.bytes().try_fold(0u64, |acc, b| {
        let value = match b {
            b'0'..=b'9' => b - b'0',
            b'A'..=b'Z' => b - b'A' + 10,
            b'a'..=b'z' => b - b'a' + 36,
            _ => return None,
        };
        Some(acc * 62 + u64::from(value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_layout() {
        let name =
            ArtifactName::new(ArtifactKind::Command, "relay00", Grade::new('c').unwrap(), 63).unwrap();
        assert_eq!(name.as_str(), "C.relay00c00011");
        assert_eq!(name.as_str().len(), ARTIFACT_NAME_LEN);
        assert_eq!(name.kind(), ArtifactKind::Command);
        assert_eq!(name.component(), "relay00");
        assert_eq!(name.grade().as_char(), 'c');
        assert_eq!(name.sequence(), 63);
        assert_eq!(name.suffix(), "c00011");
    }

    #[test]
    fn test_sequence_wraps() {
        assert_eq!(encode_sequence(SEQUENCE_SPACE - 1), "zzzzz");
        assert_eq!(encode_sequence(SEQUENCE_SPACE), "00000");
        assert_eq!(decode_sequence("zzzzz"), Some(SEQUENCE_SPACE - 1));
        assert_eq!(decode_sequence("zz!zz"), None);
    }

    #[test]
    fn test_rejects_malformed_names() {
        for bad in [
            "C.relay00c0001",
            "C.relay00c000011",
            "Q.relay00c00011",
            "C-relay00c00011",
            "C.relay_0c00011",
            "C.relay001000011",
        ] {
            assert!(bad.parse::<ArtifactName>().is_err(), "{bad} accepted");
        }
        assert!("X.localnoX0000a".parse::<ArtifactName>().is_ok());
    }
}
