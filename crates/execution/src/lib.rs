//! Execution layer: admission control for execution workers, execute file
//! enumeration, and the worker pass that runs queued requests.

#![warn(missing_docs)]

pub mod admission;
pub mod scanner;
pub mod worker;

pub use admission::{Admission, AdmissionController, DirectoryLock, ExecutionPermit, FileLock};
pub use scanner::{ExecuteScanner, QueuedExecute};
pub use worker::{CommandRunner, ExecuteJob, PassReport, RunOutcome, XqtWorker};
