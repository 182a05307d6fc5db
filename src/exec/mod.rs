//! Traced execution
//!
//! Launches a command under ptrace and turns its file-access syscalls into
//! ordered records, with type-state enforcement of the launch sequence.

pub mod spawn;
pub mod stream;
pub mod tracer;

pub use tracer::{ProcessTracer, TraceOutcome, TracerOptions};
