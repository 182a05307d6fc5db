//! Run artifacts
//!
//! Run-scoped directories for journals, trace streams and reports.

pub mod workspace;
