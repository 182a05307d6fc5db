//! deptrace: discover the packages a command needs by tracing the files it
//! fails to open
//!
//! # Architecture
//!
//! ## Kernel Interfaces ([`kernel`])
//! - [`kernel::arch`]: Per-architecture syscall tables and path argument decoding
//! - [`kernel::regs`]: Register snapshots through `PTRACE_GETREGSET`
//! - [`kernel::memory`]: NUL-terminated string reads from tracee memory
//! - [`kernel::signal`]: Signal handling and cooperative cancellation
//!
//! ## Traced Execution ([`exec`])
//! - [`exec::spawn`]: Type-state enforced tracee launch
//! - [`exec::tracer`]: Syscall stop loop producing file-access records
//! - [`exec::stream`]: JSON-lines record stream between sandbox and host
//!
//! ## Package Index ([`index`])
//! - [`index::contents`]: Debian `Contents-<arch>` listings, cached as JSON
//!
//! ## Sandboxes ([`sandbox`])
//! - [`sandbox::docker`]: Snapshot images and traced trial containers
//!
//! ## Resolution ([`resolve`])
//! - [`resolve::candidate`]: Content-keyed package sets
//! - [`resolve::node`]: Search tree arena and trial states
//! - [`resolve::trial`]: Trial classification, dedup cache, sibling windows
//! - [`resolve::engine`]: Backtracking search
//!
//! ## Observability ([`observability`])
//! - [`observability::journal`]: Structured search journal
//!
//! ## Run Artifacts ([`safety`])
//! - [`safety::workspace`]: Run-scoped directories and reports
//!
//! ## Configuration ([`config`])
//! - [`config::loader`]: `deptrace.json` and host platform detection
//! - [`config::types`]: Shared types and the error enum
//!
//! # Design Principles
//!
//! 1. **Observe, don't guess** - Only missing files the command actually
//!    touched drive the search
//! 2. **Deterministic order** - Paths in observation order, providers in
//!    index order, depth-first traversal
//! 3. **Never twice** - A package set is materialized at most once per search
//! 4. **Types prevent errors** - Tracees cannot be traced before they are configured
//! 5. **Minimal unsafe** - Thin wrappers with explicit preconditions

// Kernel Interfaces
pub mod kernel;

// Traced Execution
pub mod exec;

// Package Index
pub mod index;

// Sandboxes
pub mod sandbox;

// Resolution
pub mod resolve;

// Observability
pub mod observability;

// Run Artifacts
pub mod safety;

// Configuration
pub mod config;

// CLI entrypoint wiring for the deptrace binary
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
pub use exec::{ProcessTracer, TraceOutcome, TracerOptions};
pub use index::{ContentsIndex, PackageIndex};
pub use resolve::{CandidateSet, EngineOptions, PartialResolution, Resolution, ResolutionEngine};
pub use sandbox::{SandboxProvider, SnapshotHandle};
