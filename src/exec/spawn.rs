use crate::config::types::{DeptraceError, Result, TrialCommand};
/// Traced child launch
///
/// The launch sequence is fixed:
/// 1. fork
/// 2. child: PTRACE_TRACEME, raise(SIGSTOP)
/// 3. parent: wait for that stop
/// 4. parent: PTRACE_SETOPTIONS (TRACESYSGOOD, EXITKILL, optional fork events)
/// 5. child resumes into execvp under syscall tracing
///
/// Steps 3-4 are a type-state chain: only `Tracee<Attached>` can be resumed,
/// so the trace loop cannot run against a tracee whose options are unset.
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::ffi::CString;
use std::marker::PhantomData;

/// Type-state marker: forked and stopped before exec, options not set
pub struct Stopped;

/// Type-state marker: trace options applied, ready to resume
pub struct Attached;

/// A child process under ptrace control
///
/// Dropping an armed tracee kills and reaps it, so an abandoned trial never
/// leaves a stopped or running child behind.
pub struct Tracee<S> {
    pid: Pid,
    armed: bool,
    _state: PhantomData<S>,
}

impl<S> Tracee<S> {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    fn transition<T>(mut self) -> Tracee<T> {
        self.armed = false;
        Tracee {
            pid: self.pid,
            armed: true,
            _state: PhantomData,
        }
    }
}

fn to_cstring(value: &str) -> Result<CString> {
    CString::new(value).map_err(|_| {
        DeptraceError::Config(format!("argument contains NUL byte: {:?}", value))
    })
}

impl Tracee<Stopped> {
    /// Fork `command` as a traced child stopped before exec
    pub fn spawn(command: &TrialCommand) -> Result<Self> {
        if command.program.is_empty() {
            return Err(DeptraceError::Config("empty command".to_string()));
        }

        // Everything the child needs is allocated before fork.
        let program = to_cstring(&command.program)?;
        let argv = command
            .argv()
            .iter()
            .map(|a| to_cstring(a))
            .collect::<Result<Vec<_>>>()?;
        let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());

        // SAFETY: the child makes only async-signal-safe calls until exec.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                // Async-signal-safe calls only from here on.
                if ptrace::traceme().is_err() {
                    unsafe { libc::_exit(126) };
                }
                let _ = signal::raise(Signal::SIGSTOP);
                // SAFETY: `program` and every `argv_ptrs` entry point into
                // CStrings owned by this frame; the array is NULL-terminated.
                unsafe {
                    libc::execvp(program.as_ptr(), argv_ptrs.as_ptr());
                    libc::_exit(127)
                }
            }
            Ok(ForkResult::Parent { child }) => {
                let tracee = Tracee {
                    pid: child,
                    armed: true,
                    _state: PhantomData,
                };
                match waitpid(child, None) {
                    Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => {
                        log::debug!("Traced child {} stopped before exec", child);
                        Ok(tracee)
                    }
                    Ok(other) => Err(DeptraceError::Tracer(format!(
                        "child {} did not stop before exec: {:?}",
                        child, other
                    ))),
                    Err(e) => Err(DeptraceError::Tracer(format!(
                        "waitpid({}) for initial stop failed: {}",
                        child, e
                    ))),
                }
            }
            Err(e) => Err(DeptraceError::Tracer(format!("fork failed: {}", e))),
        }
    }

    /// Apply trace options; syscall stops become distinguishable from
    /// signal-delivery stops
    pub fn attach(self, follow_forks: bool) -> Result<Tracee<Attached>> {
        let mut options = Options::PTRACE_O_TRACESYSGOOD | Options::PTRACE_O_EXITKILL;
        if follow_forks {
            options |= Options::PTRACE_O_TRACEFORK
                | Options::PTRACE_O_TRACEVFORK
                | Options::PTRACE_O_TRACECLONE;
        }

        ptrace::setoptions(self.pid, options).map_err(|e| {
            DeptraceError::Tracer(format!("PTRACE_SETOPTIONS on {} failed: {}", self.pid, e))
        })?;

        Ok(self.transition())
    }
}

impl Tracee<Attached> {
    /// The process exited and was reaped; nothing left to clean up
    pub fn mark_reaped(mut self) {
        self.armed = false;
    }
}

impl<S> Drop for Tracee<S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let _ = signal::kill(self.pid, Signal::SIGKILL);
        // Reap so the pid does not linger as a zombie
        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => break,
                Ok(_) => continue,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
    }
}
