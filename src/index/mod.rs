//! Package index: reverse lookup from a filesystem path to the packages
//! that install it.

pub mod contents;
pub mod mirror;

pub use contents::ContentsIndex;
pub use mirror::ArchiveMirror;

use crate::config::types::{IndexKey, Result};
use std::path::Path;

/// Path to providers lookup for one (package manager, os, release, arch)
///
/// `lookup` must be stable: the same path always yields the same providers
/// in the same order, since the search explores branches in that order.
pub trait PackageIndex: Send + Sync {
    /// Providers of `path`, best first; empty when nothing provides it
    fn lookup(&self, path: &str) -> Result<Vec<String>>;

    /// Replace the index contents with those built from `source`
    fn rebuild(&mut self, key: &IndexKey, source: &Path) -> Result<()>;
}

/// Canonical lookup form of a path observed by the tracer.
///
/// `.` and `..` components are folded lexically and the leading `/` is
/// dropped, since package contents listings are relative to the root.
/// `..` never climbs above the root.
pub fn normalize_lookup_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Absolute lexical form of an observed path (`/a/b/../c` becomes `/a/c`);
/// relative paths are returned unchanged
pub fn resolve_dot_dot(path: &str) -> String {
    if !path.starts_with('/') || !path.split('/').any(|c| c == ".." || c == ".") {
        return path.to_string();
    }
    format!("/{}", normalize_lookup_path(path))
}
