use log::info;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
/// Async-safe signal handling and cooperative cancellation
///
/// SIGINT/SIGTERM/SIGHUP only flip atomics here. Long-running work polls a
/// `CancelToken`, which observes those atomics alongside its own flags and
/// an optional deadline.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Global shutdown flag (async-safe atomic)
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Signal handler state
pub struct SignalHandler;

impl SignalHandler {
    /// Initialize signal handlers
    /// Must be called early in main() before any threads are spawned
    pub fn init() -> Result<Self, String> {
        Self::install_signal_handlers()?;
        Ok(Self)
    }

    /// Install signal handlers for SIGINT, SIGTERM, SIGHUP
    fn install_signal_handlers() -> Result<(), String> {
        let sig_action = SigAction::new(
            SigHandler::Handler(Self::signal_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        // SAFETY: the installed handler only stores to an atomic.
        unsafe {
            signal::sigaction(Signal::SIGINT, &sig_action)
                .map_err(|e| format!("Failed to install SIGINT handler: {}", e))?;

            signal::sigaction(Signal::SIGTERM, &sig_action)
                .map_err(|e| format!("Failed to install SIGTERM handler: {}", e))?;

            signal::sigaction(Signal::SIGHUP, &sig_action)
                .map_err(|e| format!("Failed to install SIGHUP handler: {}", e))?;
        }

        info!("Signal handlers installed (SIGINT, SIGTERM, SIGHUP)");
        Ok(())
    }

    /// Only an atomic store: no allocation, no locks, no I/O
    extern "C" fn signal_handler(_signal: libc::c_int) {
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        shutdown_requested()
    }
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Cooperative cancellation handle shared between the engine and a trial.
///
/// A token is cancelled when its own flag or any ancestor's flag is set,
/// when its deadline passes, or (for tokens built with
/// [`CancelToken::from_signals`]) when a termination signal arrived.
#[derive(Clone, Debug)]
pub struct CancelToken {
    flags: Vec<Arc<AtomicBool>>,
    deadline: Option<Instant>,
    observe_signals: bool,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flags: vec![Arc::new(AtomicBool::new(false))],
            deadline: None,
            observe_signals: false,
        }
    }

    /// Root token that also trips on SIGINT/SIGTERM/SIGHUP
    pub fn from_signals() -> Self {
        Self {
            observe_signals: true,
            ..Self::new()
        }
    }

    /// Token cancelled with this one, but cancellable on its own too
    pub fn child(&self) -> Self {
        let mut flags = self.flags.clone();
        flags.push(Arc::new(AtomicBool::new(false)));
        Self {
            flags,
            deadline: self.deadline,
            observe_signals: self.observe_signals,
        }
    }

    /// Same token with a deadline `timeout` from now (the earlier one wins)
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        self
    }

    pub fn cancel(&self) {
        if let Some(own) = self.flags.last() {
            own.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        if self.observe_signals && shutdown_requested() {
            return true;
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return true;
        }
        self.flags.iter().any(|f| f.load(Ordering::SeqCst))
    }

    /// Whether cancellation came from the deadline rather than a flag
    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
