/// Structured search journal
///
/// Every decision of a resolution run is appended as one JSON line to
/// `journal.jsonl` in the run workspace and mirrored to the `log` facade,
/// so a failed search can be replayed step by step afterwards.
use crate::config::types::{DeptraceError, ExitStatus, Result};
use crate::resolve::node::TrialState;
use log::{debug, info, warn};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

/// One journal entry
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SearchEvent {
    SearchStarted {
        command: String,
        base: Vec<String>,
        max_solutions: usize,
    },
    TrialStarted {
        node: usize,
        depth: usize,
        candidates: Vec<String>,
    },
    TrialFinished {
        node: usize,
        candidates: Vec<String>,
        state: TrialState,
        exit: Option<ExitStatus>,
        missing: usize,
        unexplained: usize,
    },
    Reused {
        node: usize,
        candidates: Vec<String>,
        state: TrialState,
    },
    Skipped {
        candidates: Vec<String>,
        reason: String,
    },
    Backtrack {
        node: usize,
        candidates: Vec<String>,
        reason: String,
    },
    Solution {
        index: usize,
        candidates: Vec<String>,
    },
    Exhausted {
        best_partial: Vec<String>,
        unresolved_paths: Vec<String>,
    },
}

impl SearchEvent {
    fn summary(&self) -> String {
        match self {
            SearchEvent::SearchStarted { command, base, .. } if base.is_empty() => {
                format!("Resolving `{}`", command)
            }
            SearchEvent::SearchStarted { command, base, .. } => {
                format!("Resolving `{}` on top of [{}]", command, base.join(", "))
            }
            SearchEvent::TrialStarted { node, depth, candidates } => format!(
                "Trial #{} (depth {}) with [{}]",
                node,
                depth,
                candidates.join(", ")
            ),
            SearchEvent::TrialFinished {
                node,
                state,
                missing,
                unexplained,
                ..
            } => format!(
                "Trial #{} finished {:?}: {} missing, {} unexplained",
                node, state, missing, unexplained
            ),
            SearchEvent::Reused {
                node,
                candidates,
                state,
            } => format!(
                "Trial #{} reuses the result of [{}]: {:?}",
                node,
                candidates.join(", "),
                state
            ),
            SearchEvent::Skipped { candidates, reason } => {
                format!("Skipping [{}]: {}", candidates.join(", "), reason)
            }
            SearchEvent::Backtrack { candidates, reason, .. } => {
                format!("Backtracking from [{}]: {}", candidates.join(", "), reason)
            }
            SearchEvent::Solution { index, candidates } => {
                format!("Solution {}: [{}]", index + 1, candidates.join(", "))
            }
            SearchEvent::Exhausted {
                best_partial,
                unresolved_paths,
            } => format!(
                "Search exhausted; best partial [{}] leaves {} path(s) unresolved",
                best_partial.join(", "),
                unresolved_paths.len()
            ),
        }
    }

    fn emit_log(&self) {
        match self {
            SearchEvent::Solution { .. } | SearchEvent::SearchStarted { .. } => {
                info!("{}", self.summary())
            }
            SearchEvent::Exhausted { .. } => warn!("{}", self.summary()),
            _ => debug!("{}", self.summary()),
        }
    }
}

/// Append-only JSON-lines journal
pub struct Journal {
    file: Mutex<File>,
    path: PathBuf,
    run_id: String,
}

impl Journal {
    pub fn create(path: &Path, run_id: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DeptraceError::Config(format!("Failed to create journal directory: {}", e))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| DeptraceError::Config(format!("Failed to open search journal: {}", e)))?;
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            run_id: run_id.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, event: &SearchEvent) {
        event.emit_log();

        let mut entry = match serde_json::to_value(event) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to serialize journal event: {}", e);
                return;
            }
        };
        entry["timestamp"] = serde_json::json!(SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64);
        entry["run_id"] = serde_json::json!(self.run_id);

        if let Ok(mut file) = self.file.lock() {
            if let Err(e) = writeln!(file, "{}", entry) {
                warn!("Failed to write to search journal: {}", e);
            }
        } else {
            warn!("Failed to acquire lock on search journal");
        }
    }
}

/// Record through an optional journal; without one the event only reaches
/// the log
pub fn record(journal: Option<&Journal>, event: SearchEvent) {
    match journal {
        Some(journal) => journal.record(&event),
        None => event.emit_log(),
    }
}
