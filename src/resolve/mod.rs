//! Backtracking dependency resolution
//!
//! Trials are materialized through a [`SandboxProvider`](crate::sandbox::SandboxProvider),
//! observed by the tracer, and classified against a
//! [`PackageIndex`](crate::index::PackageIndex).

pub mod candidate;
pub mod engine;
pub mod node;
pub mod trial;

pub use candidate::{CandidateSet, PackageCandidate};
pub use engine::{EngineOptions, EngineStats, PartialResolution, Resolution, ResolutionEngine};
pub use node::TrialState;
