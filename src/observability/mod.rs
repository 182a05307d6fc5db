//! Observability
//!
//! Structured search events for replaying a resolution run.

pub mod journal;
