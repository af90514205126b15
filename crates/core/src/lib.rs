//! Spoolman core data model.
//!
//! Plain values shared by the spool engine: grades, peer names, fixed-width
//! artifact names, queued commands, job identifiers, contact status and
//! execute descriptors. Nothing here touches the filesystem.

#![warn(missing_docs)]

mod error;
mod grade;
mod peer;
mod artifact;
mod id;
mod command;
mod status;
mod execute;

pub use error::{ModelError, Result};
pub use grade::Grade;
pub use peer::{PeerName, MAX_PEER_NAME_LEN, PEER_COMPONENT_LEN};
pub use artifact::{
    ArtifactKind, ArtifactName, ARTIFACT_NAME_LEN, SEQUENCE_DIGITS, SEQUENCE_SPACE,
    decode_sequence, encode_sequence,
};
pub use id::{JobId, SequenceToken};
pub use command::{Command, CommandKind};
pub use status::{RetryPolicy, Status, StatusKind};
pub use execute::{ExecuteDescriptor, OutputTarget, RequiredFile};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
