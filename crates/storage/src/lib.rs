//! Filesystem spool for spoolman.
//!
//! Independent processes cooperate through this crate purely via the
//! filesystem: exclusive creates for locks, renames for atomic visibility
//! and directory entries as the source of truth for the queue.

#![warn(missing_docs)]

pub mod config;
pub mod counter;
mod entry;
pub mod error;
pub mod fsutil;
pub mod layout;
pub mod lock;
pub mod lockfile;
pub mod naming;
pub mod queue;
pub mod registry;
pub mod spool;
pub mod status;
pub mod writer;

pub use config::SpoolConfig;
pub use counter::PersistentCounter;
pub use error::{Result, StorageError};
pub use layout::SpoolLayout;
pub use lock::{SystemLock, SystemLockGuard};
pub use lockfile::{break_if_stale, is_pid_alive, read_record, LockFile, LockOutcome, LockRecord};
pub use naming::{NameAllocator, NameSet};
pub use queue::{QueuedJob, WorkCursor, WorkQueue};
pub use registry::{Authorizer, JobRegistry, PrivilegedUsers, ResolvedJob};
pub use spool::Spool;
pub use status::StatusLedger;
pub use writer::{InboundFile, Payload, SpoolRequest, SpoolWriter};
