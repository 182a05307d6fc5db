//! Thin wrappers around Linux kernel primitives.
//!
//! Register and memory access for traced processes lives here, next to the
//! signal plumbing the tracer and the engine share.
//! Dependency direction: signal -> arch -> regs -> memory

pub mod arch;
pub mod memory;
pub mod regs;
pub mod signal;
