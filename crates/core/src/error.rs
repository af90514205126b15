//! Validation errors for the spool data model.

/// Result alias for model parsing and validation.
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors raised while parsing or validating spool model values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// A grade outside `A-Z` / `a-z`
    #[error("invalid grade {0:?}: grades are single ASCII letters")]
    InvalidGrade(String),

    /// A peer name that cannot be used as a spool directory
    #[error("invalid peer name {name:?}: {reason}")]
    InvalidPeerName {
        /// The rejected name
        name: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// A spool artifact name that does not follow the fixed-width scheme
    #[error("invalid artifact name {name:?}: {reason}")]
    InvalidArtifactName {
        /// The rejected name
        name: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// A job identifier that cannot be resolved to a queue entry
    #[error("invalid job id {0:?}")]
    InvalidJobId(String),

    /// An execute descriptor that is missing required lines
    #[error("invalid execute descriptor: {0}")]
    InvalidDescriptor(String),
}
