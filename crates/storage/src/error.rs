//! Storage error taxonomy.

use std::path::PathBuf;

/// Error type for spool operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur while touching the spool.
///
/// Lock contention is deliberately absent: it is reported through
/// [`crate::LockOutcome::Contended`], never as an error.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Filesystem write or space failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid model value
    #[error(transparent)]
    Model(#[from] spoolman_core::ModelError),

    /// Identifier or artifact missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// A queue entry or record that cannot be trusted
    #[error("corrupt spool entry for {peer} ({artifact}): {reason}")]
    Corrupt {
        /// Peer whose spool holds the entry
        peer: String,
        /// Offending artifact
        artifact: String,
        /// What is wrong with it
        reason: String,
    },

    /// Requester may not touch another user's job
    #[error("{user} may not modify job {job}")]
    PermissionDenied {
        /// Requesting user
        user: String,
        /// Job identifier
        job: String,
    },

    /// Mutation attempted through a read-only cursor
    #[error("cursor was opened read-only")]
    ReadOnly,

    /// Sequence token from another cursor, or already retired
    #[error("sequence token {0} is not valid for this cursor")]
    InvalidToken(String),

    /// A short internal critical section stayed locked
    #[error("{} is busy", .0.display())]
    Busy(PathBuf),

    /// A batch with no commands
    #[error("refusing to spool an empty batch")]
    EmptyBatch,

    /// Configuration could not be loaded
    #[error("configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Build a corruption error.
    pub fn corrupt(peer: impl ToString, artifact: impl ToString, reason: impl ToString) -> Self {
        StorageError::Corrupt {
            peer: peer.to_string(),
            artifact: artifact.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether this is a not-found condition.
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::NotFound(_) => true,
            StorageError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
