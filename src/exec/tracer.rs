//! Syscall tracer reporting the file paths a command touches.
//!
//! The loop resumes each tracee with `PTRACE_SYSCALL`, pairs syscall
//! entry/exit stops per process, and on every entry of a file-access call
//! copies the path argument out of the tracee and checks whether it exists
//! on the tracer's own filesystem view.

use crate::config::types::{DeptraceError, ExitStatus, FileAccessRecord, Result, TrialCommand};
use crate::exec::spawn::{Attached, Tracee};
use crate::kernel::arch::{Arch, SyscallRegs};
use crate::kernel::memory::{read_c_string, TraceeMemory};
use crate::kernel::regs::read_syscall_regs;
use crate::kernel::signal::CancelToken;
use nix::errno::Errno;
use nix::sys::ptrace::{self, Event};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Which half of a syscall the last stop belonged to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallPhase {
    Entry,
    Exit,
}

/// Per-process tracing state
#[derive(Debug, Clone)]
pub struct TracedProcess {
    pub pid: Pid,
    pub arch: Arch,
    pub phase: SyscallPhase,
    pub last_syscall: Option<u64>,
    pub regs: Option<SyscallRegs>,
}

impl TracedProcess {
    /// A fresh tracee is outside any syscall, so its next stop is an entry
    pub fn new(pid: Pid, arch: Arch) -> Self {
        Self {
            pid,
            arch,
            phase: SyscallPhase::Exit,
            last_syscall: None,
            regs: None,
        }
    }

    /// Record a syscall stop and return which half it was
    pub fn advance(&mut self) -> SyscallPhase {
        self.phase = match self.phase {
            SyscallPhase::Entry => SyscallPhase::Exit,
            SyscallPhase::Exit => SyscallPhase::Entry,
        };
        self.phase
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TracerOptions {
    /// Trace fork/vfork/clone children as well
    pub follow_forks: bool,
}

/// Exit status and ordered file-access records of one traced run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceOutcome {
    pub exit: ExitStatus,
    pub records: Vec<FileAccessRecord>,
}

/// Existence test on the tracer's filesystem view (stat, follows symlinks)
pub fn path_exists(path: &str) -> bool {
    std::fs::metadata(path).is_ok()
}

pub struct ProcessTracer {
    arch: Arch,
    options: TracerOptions,
}

impl ProcessTracer {
    pub fn new(options: TracerOptions) -> Self {
        Self {
            arch: Arch::host(),
            options,
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Run `command` to completion and collect its file accesses
    pub fn trace(&self, command: &TrialCommand) -> Result<TraceOutcome> {
        self.trace_cancellable(command, &CancelToken::new())
    }

    /// Like [`trace`](Self::trace), but the child is killed once `cancel`
    /// fires and the call reports [`DeptraceError::Cancelled`]
    pub fn trace_cancellable(
        &self,
        command: &TrialCommand,
        cancel: &CancelToken,
    ) -> Result<TraceOutcome> {
        let mut records = Vec::new();
        let exit = self.trace_with_sink(command, cancel, &mut |record| {
            records.push(record);
            Ok(())
        })?;
        Ok(TraceOutcome { exit, records })
    }

    /// Trace `command`, handing each record to `sink` as it is observed
    pub fn trace_with_sink(
        &self,
        command: &TrialCommand,
        cancel: &CancelToken,
        sink: &mut dyn FnMut(FileAccessRecord) -> Result<()>,
    ) -> Result<ExitStatus> {
        let tracee = Tracee::spawn(command)?.attach(self.options.follow_forks)?;
        log::debug!("Tracing `{}` as pid {} ({})", command, tracee.pid(), self.arch);

        let finished = Arc::new(AtomicBool::new(false));
        let killed = Arc::new(AtomicBool::new(false));
        let watchdog = {
            let finished = Arc::clone(&finished);
            let killed = Arc::clone(&killed);
            let cancel = cancel.clone();
            let pid = tracee.pid();
            std::thread::spawn(move || {
                while !finished.load(Ordering::SeqCst) {
                    if cancel.is_cancelled() {
                        killed.store(true, Ordering::SeqCst);
                        let _ = signal::kill(pid, Signal::SIGKILL);
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
            })
        };

        let result = self.run_loop(tracee, sink);
        finished.store(true, Ordering::SeqCst);
        let _ = watchdog.join();

        if killed.load(Ordering::SeqCst) {
            log::debug!("Trace of `{}` cancelled", command);
            return Err(DeptraceError::Cancelled);
        }
        result
    }

    fn run_loop(
        &self,
        tracee: Tracee<Attached>,
        sink: &mut dyn FnMut(FileAccessRecord) -> Result<()>,
    ) -> Result<ExitStatus> {
        let root = tracee.pid();
        let mut processes: HashMap<Pid, TracedProcess> = HashMap::new();
        processes.insert(root, TracedProcess::new(root, self.arch));

        match self.drive(root, &mut processes, sink) {
            Ok(status) => {
                tracee.mark_reaped();
                Ok(status)
            }
            Err(e) => {
                for pid in processes.keys().filter(|pid| **pid != root) {
                    let _ = signal::kill(*pid, Signal::SIGKILL);
                }
                // dropping the armed tracee kills and reaps the root
                drop(tracee);
                Err(e)
            }
        }
    }

    fn drive(
        &self,
        root: Pid,
        processes: &mut HashMap<Pid, TracedProcess>,
        sink: &mut dyn FnMut(FileAccessRecord) -> Result<()>,
    ) -> Result<ExitStatus> {
        let wait_target = if self.options.follow_forks {
            None
        } else {
            Some(root)
        };
        // Tracees belong to this thread; other tracers in the process own theirs
        let wait_flags = if self.options.follow_forks {
            Some(WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD)
        } else {
            None
        };
        let mut root_status: Option<ExitStatus> = None;

        resume(root, None)?;

        loop {
            let status = match waitpid(wait_target, wait_flags) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    return root_status.ok_or_else(|| {
                        DeptraceError::Tracer(format!("traced process {} vanished", root))
                    });
                }
                Err(e) => {
                    return Err(DeptraceError::Tracer(format!("waitpid failed: {}", e)));
                }
            };

            match status {
                WaitStatus::PtraceSyscall(pid) => {
                    let arch = self.arch;
                    let process = processes
                        .entry(pid)
                        .or_insert_with(|| TracedProcess::new(pid, arch));
                    if process.advance() == SyscallPhase::Entry {
                        on_syscall_entry(process, sink)?;
                    }
                    resume(pid, None)?;
                }
                WaitStatus::PtraceEvent(pid, _, event) => {
                    if is_fork_event(event) {
                        let child = ptrace::getevent(pid).map_err(|e| {
                            DeptraceError::Tracer(format!("PTRACE_GETEVENTMSG on {}: {}", pid, e))
                        })?;
                        let child = Pid::from_raw(child as libc::pid_t);
                        log::trace!("pid {} spawned traced child {}", pid, child);
                        processes
                            .entry(child)
                            .or_insert_with(|| TracedProcess::new(child, self.arch));
                    }
                    resume(pid, None)?;
                }
                WaitStatus::Stopped(pid, sig) => {
                    let known = processes.contains_key(&pid);
                    if !known {
                        // a new fork child may report its initial stop before
                        // the parent's fork event
                        processes.insert(pid, TracedProcess::new(pid, self.arch));
                    }
                    let inject = match sig {
                        Signal::SIGTRAP => None,
                        Signal::SIGSTOP if !known => None,
                        other => Some(other),
                    };
                    resume(pid, inject)?;
                }
                WaitStatus::Exited(pid, code) => {
                    processes.remove(&pid);
                    if pid == root {
                        root_status = Some(ExitStatus::Exited(code));
                    }
                }
                WaitStatus::Signaled(pid, sig, _) => {
                    processes.remove(&pid);
                    if pid == root {
                        root_status = Some(ExitStatus::Signaled(sig as i32));
                    }
                }
                _ => continue,
            }

            if let Some(status) = root_status {
                if !self.options.follow_forks || processes.is_empty() {
                    return Ok(status);
                }
            }
        }
    }
}

fn is_fork_event(event: i32) -> bool {
    event == Event::PTRACE_EVENT_FORK as i32
        || event == Event::PTRACE_EVENT_VFORK as i32
        || event == Event::PTRACE_EVENT_CLONE as i32
}

/// Resume until the next syscall boundary; a tracee that died in between
/// is reported by the next wait
fn resume(pid: Pid, sig: Option<Signal>) -> Result<()> {
    match ptrace::syscall(pid, sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(DeptraceError::Tracer(format!(
            "PTRACE_SYSCALL on {} failed: {}",
            pid, e
        ))),
    }
}

fn on_syscall_entry(
    process: &mut TracedProcess,
    sink: &mut dyn FnMut(FileAccessRecord) -> Result<()>,
) -> Result<()> {
    let regs = read_syscall_regs(process.pid)?;
    process.last_syscall = Some(regs.number);
    process.regs = Some(regs);

    let Some((descriptor, pointer)) = regs.path_pointer(process.arch) else {
        return Ok(());
    };
    if pointer == 0 {
        return Ok(());
    }

    let bytes = read_c_string(&TraceeMemory::new(process.pid), pointer);
    if bytes.is_empty() {
        return Ok(());
    }

    let path = String::from_utf8_lossy(&bytes).into_owned();
    let existed = path_exists(&path);
    log::trace!(
        "pid {} {}({:?}) -> {}",
        process.pid,
        descriptor.name,
        path,
        if existed { "exists" } else { "missing" }
    );
    sink(FileAccessRecord { existed, path })
}
