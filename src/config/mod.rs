//! Configuration
//!
//! Resolver settings, host platform detection, and the shared type
//! definitions every module builds on.

pub mod loader;
pub mod types;
