//! Isolated, snapshotable trial environments.
//!
//! The resolution engine only sees [`SandboxProvider`]; [`docker`] is the
//! adapter the binary uses.

pub mod docker;

pub use docker::DockerSandbox;

use crate::config::types::{ExitStatus, FileAccessRecord, Result, TrialCommand};
use crate::exec::stream::read_records_from_file;
use crate::kernel::signal::CancelToken;
use std::path::{Path, PathBuf};

/// Opaque reference to one snapshot, plus the packages installed in it on
/// top of the base environment
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotHandle {
    pub id: String,
    pub packages: Vec<String>,
}

impl SnapshotHandle {
    pub fn new(id: impl Into<String>, packages: Vec<String>) -> Self {
        Self {
            id: id.into(),
            packages,
        }
    }
}

/// Where the records of one run can be read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceSource {
    /// Traced in-process; records already collected
    Records(Vec<FileAccessRecord>),
    /// Record stream file written by a tracer inside the sandbox
    Stream(PathBuf),
}

impl TraceSource {
    pub fn into_records(self) -> Result<Vec<FileAccessRecord>> {
        match self {
            TraceSource::Records(records) => Ok(records),
            TraceSource::Stream(path) => read_records_from_file(&path),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialRun {
    pub exit: ExitStatus,
    pub trace: TraceSource,
}

/// Capability to materialize and run trials
///
/// Snapshots are independent: installing into one never affects another,
/// so sibling trials may run concurrently.
pub trait SandboxProvider: Send + Sync {
    /// A fresh snapshot: the pristine base environment for `None`,
    /// otherwise an independent branch with the same contents as `base`
    fn new_snapshot(&self, base: Option<&SnapshotHandle>) -> Result<SnapshotHandle>;

    /// Install `package` into `snapshot`; the returned handle reflects it and
    /// may or may not share the input's id
    fn install(&self, snapshot: &SnapshotHandle, package: &str) -> Result<SnapshotHandle>;

    /// Run `command` traced inside `snapshot`, with `cwd_mirror` (the
    /// invoking directory) visible as its working directory. Must kill the
    /// command and return [`Cancelled`](crate::DeptraceError::Cancelled)
    /// once `cancel` fires.
    fn run(
        &self,
        snapshot: &SnapshotHandle,
        command: &TrialCommand,
        cwd_mirror: &Path,
        cancel: &CancelToken,
    ) -> Result<TrialRun>;

    /// Release a snapshot; failures are logged, never raised
    fn discard(&self, snapshot: SnapshotHandle);
}
