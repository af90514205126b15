//! Execute descriptors.
//!
//! An execute file is a short line-oriented description of a command to run
//! once all of its data files have arrived:
//!
//! ```text
//! U alice gateway
//! F D.gatewayX0003b letter
//! I D.gatewayX0003b
//! O result.txt gateway
//! C rmail bob
//! ```
//!
//! Blank lines and lines starting with `#` are ignored, as are unknown
//! line types, so newer peers can add fields.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ModelError, Result};

/// A spool file the command needs before it may run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredFile {
    /// Name of the file in the spool
    pub spool_name: String,
    /// Name the command expects it under, if different
    pub local_name: Option<String>,
}

/// Where standard output goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputTarget {
    /// Destination file
    pub file: String,
    /// Peer to send it to, if not local
    pub peer: Option<String>,
}

/// A parsed execute file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteDescriptor {
    /// Requesting user
    pub user: String,
    /// Peer the request came from
    pub peer: String,
    /// Files that must be present
    pub files: Vec<RequiredFile>,
    /// Standard input file
    pub input: Option<String>,
    /// Standard output destination
    pub output: Option<OutputTarget>,
    /// Command name followed by its arguments
    pub argv: Vec<String>,
    /// Whether to send a completion notice
    pub notify: bool,
    /// Address to send notices to instead of `user`
    pub requestor: Option<String>,
}

impl ExecuteDescriptor {
    /// A descriptor for `argv` requested by `user` on `peer`.
    pub fn new(user: impl Into<String>, peer: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            user: user.into(),
            peer: peer.into(),
            files: Vec::new(),
            input: None,
            output: None,
            argv,
            notify: true,
            requestor: None,
        }
    }

    /// The command being requested.
    pub fn command_name(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }
}

impl FromStr for ExecuteDescriptor {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        let mut user = None;
        let mut files = Vec::new();
        let mut input = None;
        let mut output = None;
        let mut argv = Vec::new();
        let mut notify = true;
        let mut requestor = None;

        for line in s.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let tag = fields.next().unwrap_or_default();
            let mut rest: Vec<String> = fields.map(str::to_string).collect();
            match tag {
                "U" => {
                    if rest.len() != 2 {
                        return Err(ModelError::InvalidDescriptor(format!("bad U line: {line}")));
                    }
                    let peer = rest.pop().unwrap_or_default();
                    let name = rest.pop().unwrap_or_default();
                    user = Some((name, peer));
                }
                "F" => {
                    let mut it = rest.into_iter();
                    let spool_name = it
                        .next()
                        .ok_or_else(|| ModelError::InvalidDescriptor("empty F line".into()))?;
                    files.push(RequiredFile {
                        spool_name,
                        local_name: it.next(),
                    });
                }
                "I" => input = rest.into_iter().next(),
                "O" => {
                    let mut it = rest.into_iter();
                    output = it.next().map(|file| OutputTarget { file, peer: it.next() });
                }
                "C" => argv = rest,
                "N" => notify = false,
                "R" => requestor = rest.into_iter().next(),
                _ => {}
            }
        }

        let (user, peer) = user.ok_or_else(|| ModelError::InvalidDescriptor("missing U line".into()))?;
        if argv.is_empty() {
            return Err(ModelError::InvalidDescriptor("missing C line".into()));
        }

        Ok(Self {
            user,
            peer,
            files,
            input,
            output,
            argv,
            notify,
            requestor,
        })
    }
}

impl fmt::Display for ExecuteDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "U {} {}", self.user, self.peer)?;
        for file in &self.files {
            match &file.local_name {
                Some(local) => writeln!(f, "F {} {}", file.spool_name, local)?,
                None => writeln!(f, "F {}", file.spool_name)?,
            }
        }
        if let Some(input) = &self.input {
            writeln!(f, "I {input}")?;
        }
        if let Some(output) = &self.output {
            match &output.peer {
                Some(peer) => writeln!(f, "O {} {}", output.file, peer)?,
                None => writeln!(f, "O {}", output.file)?,
            }
        }
        if !self.notify {
            writeln!(f, "N")?;
        }
        if let Some(requestor) = &self.requestor {
            writeln!(f, "R {requestor}")?;
        }
        writeln!(f, "C {}", self.argv.join(" "))
    }
}
