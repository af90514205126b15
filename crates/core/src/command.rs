//! Queued transfer and execution commands.

use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactName;

/// What a queued command asks the session layer to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    /// Send a local file to the peer
    Send,
    /// Fetch a file from the peer
    Receive,
    /// Ask the peer to run a command
    Execute,
}

/// One command of a submitted batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Command kind
    pub kind: CommandKind,

    /// Source path (local for sends, remote for receives)
    pub from: String,

    /// Destination path
    pub to: String,

    /// Submitting user
    pub user: String,

    /// Option letters passed through to the transfer layer
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub options: String,

    /// Spool temporary file holding the data to send, if it was copied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp: Option<ArtifactName>,

    /// File mode to apply at the destination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,

    /// Who to notify on completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<String>,
}

impl Command {
    fn new(kind: CommandKind, from: impl Into<String>, to: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            kind,
            from: from.into(),
            to: to.into(),
            user: user.into(),
            options: String::new(),
            temp: None,
            mode: None,
            notify: None,
        }
    }

    /// A send command.
    pub fn send(from: impl Into<String>, to: impl Into<String>, user: impl Into<String>) -> Self {
        Self::new(CommandKind::Send, from, to, user)
    }

    /// A receive command.
    pub fn receive(from: impl Into<String>, to: impl Into<String>, user: impl Into<String>) -> Self {
        Self::new(CommandKind::Receive, from, to, user)
    }

    /// An execute request; `from` is the descriptor and `to` its remote name.
    pub fn execute(from: impl Into<String>, to: impl Into<String>, user: impl Into<String>) -> Self {
        Self::new(CommandKind::Execute, from, to, user)
    }

    /// Set option letters.
    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = options.into();
        self
    }

    /// Set the destination mode.
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Set the completion notice recipient.
    pub fn with_notify(mut self, notify: impl Into<String>) -> Self {
        self.notify = Some(notify.into());
        self
    }
}
