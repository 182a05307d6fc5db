/// Core types and error taxonomy for deptrace
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// One observed file access: the path argument of a file-access syscall and
/// whether it existed when the tracer looked.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileAccessRecord {
    pub existed: bool,
    pub path: String,
}

impl FileAccessRecord {
    pub fn new(path: impl Into<String>, existed: bool) -> Self {
        Self {
            existed,
            path: path.into(),
        }
    }

    pub fn missing(path: impl Into<String>) -> Self {
        Self::new(path, false)
    }

    pub fn present(path: impl Into<String>) -> Self {
        Self::new(path, true)
    }
}

/// How a traced command ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// Normal exit with the given code
    Exited(i32),
    /// Terminated by the given signal number
    Signaled(i32),
}

impl ExitStatus {
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Exited(code) => Some(*code),
            ExitStatus::Signaled(_) => None,
        }
    }

    /// Shell-style numeric status (128 + signal for signal deaths)
    pub fn as_shell_code(&self) -> i32 {
        match self {
            ExitStatus::Exited(code) => *code,
            ExitStatus::Signaled(sig) => 128 + sig,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit code {}", code),
            ExitStatus::Signaled(sig) => write!(f, "signal {}", sig),
        }
    }
}

/// A command line to run inside a trial.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl TrialCommand {
    pub fn new(program: impl Into<String>, args: &[String]) -> Self {
        Self {
            program: program.into(),
            args: args.to_vec(),
        }
    }

    /// Build from a full argv; `None` when argv is empty
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), args))
    }

    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

impl fmt::Display for TrialCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Identity of one package index: which package manager on which platform.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexKey {
    pub package_manager: String,
    pub os: String,
    pub release: String,
    pub arch: String,
}

impl IndexKey {
    pub fn new(
        package_manager: impl Into<String>,
        os: impl Into<String>,
        release: impl Into<String>,
        arch: impl Into<String>,
    ) -> Self {
        Self {
            package_manager: package_manager.into(),
            os: os.into(),
            release: release.into(),
            arch: arch.into(),
        }
    }

    /// File stem used for the persisted index
    pub fn file_stem(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.package_manager, self.os, self.release, self.arch
        )
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{}-{}",
            self.package_manager, self.os, self.release, self.arch
        )
    }
}

/// Error types for deptrace operations
#[derive(Error, Debug)]
pub enum DeptraceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The tracing primitive failed or the traced process vanished
    #[error("Tracer fault: {0}")]
    Tracer(String),

    /// Snapshot creation, package install or command launch failed
    #[error("Sandbox failure: {0}")]
    Sandbox(String),

    /// The package index could not answer; rebuilding it usually helps
    #[error("Package index lookup failed for {path}: {reason}")]
    IndexLookup { path: String, reason: String },

    /// A capability is unusable as a whole (no sandbox backend, no index)
    #[error("Backend unavailable: {0}")]
    Backend(String),

    #[error("Malformed record stream at line {line}: {details}")]
    Stream { line: usize, details: String },

    #[error("Trial cancelled")]
    Cancelled,
}

impl DeptraceError {
    /// Faults scoped to a single trial; the engine backtracks on these
    pub fn is_trial_local(&self) -> bool {
        matches!(
            self,
            DeptraceError::Tracer(_) | DeptraceError::Sandbox(_) | DeptraceError::Stream { .. }
        )
    }
}

impl From<nix::errno::Errno> for DeptraceError {
    fn from(errno: nix::errno::Errno) -> Self {
        DeptraceError::Tracer(errno.desc().to_string())
    }
}

/// Result type alias for deptrace operations
pub type Result<T> = std::result::Result<T, DeptraceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_shell_code() {
        assert_eq!(ExitStatus::Exited(3).as_shell_code(), 3);
        assert_eq!(ExitStatus::Signaled(9).as_shell_code(), 137);
        assert_eq!(ExitStatus::Signaled(9).code(), None);
    }

    #[test]
    fn test_trial_command_argv() {
        let cmd = TrialCommand::from_argv(&["ls".to_string(), "-l".to_string()]).unwrap();
        assert_eq!(cmd.program, "ls");
        assert_eq!(cmd.argv(), vec!["ls".to_string(), "-l".to_string()]);
        assert_eq!(cmd.to_string(), "ls -l");
        assert!(TrialCommand::from_argv(&[]).is_none());
    }

    #[test]
    fn test_index_key_file_stem() {
        let key = IndexKey::new("apt", "ubuntu", "noble", "amd64");
        assert_eq!(key.file_stem(), "apt_ubuntu_noble_amd64");
        assert_eq!(key.to_string(), "apt ubuntu:noble-amd64");
    }

    #[test]
    fn test_trial_local_errors() {
        assert!(DeptraceError::Tracer("gone".into()).is_trial_local());
        assert!(DeptraceError::Sandbox("disk".into()).is_trial_local());
        assert!(!DeptraceError::Backend("no docker".into()).is_trial_local());
        assert!(!DeptraceError::Cancelled.is_trial_local());
    }
}
