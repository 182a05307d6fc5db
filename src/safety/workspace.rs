/// Run-scoped workspace
///
/// Every resolution run gets its own directory holding the search journal,
/// per-trial trace streams, and the final reports. Concurrent runs never
/// share a directory.
use crate::config::types::{DeptraceError, Result};
use crate::resolve::{CandidateSet, PartialResolution};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

pub const JOURNAL_FILE: &str = "journal.jsonl";
pub const SOLUTIONS_FILE: &str = "solutions.txt";
pub const SBOM_FILE: &str = "most_promising_sbom.txt";
const TRIALS_DIR: &str = "trials";

pub struct RunWorkspace {
    run_id: String,
    run_dir: PathBuf,
    /// Directory chosen by the user; never removed
    persistent: bool,
}

impl RunWorkspace {
    /// Workspace in `log_dir`, or in a fresh uuid directory under `base_dir`.
    ///
    /// An existing non-empty `log_dir` is refused unless `force` is set, in
    /// which case its contents are removed first.
    pub fn create(log_dir: Option<&Path>, base_dir: &Path, force: bool) -> Result<Self> {
        let run_id = Uuid::new_v4().to_string();
        let (run_dir, persistent) = match log_dir {
            Some(dir) => {
                prepare_log_dir(dir, force)?;
                (dir.to_path_buf(), true)
            }
            None => (base_dir.join(&run_id), false),
        };

        fs::create_dir_all(run_dir.join(TRIALS_DIR)).map_err(|e| {
            DeptraceError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to create run directory {}: {}", run_dir.display(), e),
            ))
        })?;

        Ok(Self {
            run_id,
            run_dir,
            persistent,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn journal_path(&self) -> PathBuf {
        self.run_dir.join(JOURNAL_FILE)
    }

    /// Parent of the per-trial directories shared with sandboxes
    pub fn trials_dir(&self) -> PathBuf {
        self.run_dir.join(TRIALS_DIR)
    }

    /// One line per solution, packages space separated
    pub fn write_solutions(&self, solutions: &[CandidateSet]) -> Result<PathBuf> {
        let path = self.run_dir.join(SOLUTIONS_FILE);
        let mut file = fs::File::create(&path)?;
        for solution in solutions {
            writeln!(file, "{}", solution.packages().join(" "))?;
        }
        Ok(path)
    }

    /// Best partial set followed by the paths it leaves unresolved
    pub fn write_sbom(&self, partial: &PartialResolution) -> Result<PathBuf> {
        let path = self.run_dir.join(SBOM_FILE);
        let mut file = fs::File::create(&path)?;
        for package in partial.best_partial.packages() {
            writeln!(file, "{}", package)?;
        }
        if !partial.unresolved_paths.is_empty() {
            writeln!(file)?;
            writeln!(file, "# unresolved")?;
            for missing in &partial.unresolved_paths {
                writeln!(file, "{}", missing)?;
            }
        }
        Ok(path)
    }

    /// Remove the run directory after a successful run unless the user asked
    /// for it; otherwise leave it in place for inspection
    pub fn finish(self, success: bool) -> Option<PathBuf> {
        if success && !self.persistent {
            if let Err(e) = fs::remove_dir_all(&self.run_dir) {
                log::warn!("Failed to remove run directory {}: {}", self.run_dir.display(), e);
                return Some(self.run_dir);
            }
            return None;
        }
        log::info!("Run artifacts kept in {}", self.run_dir.display());
        Some(self.run_dir)
    }
}

fn prepare_log_dir(dir: &Path, force: bool) -> Result<()> {
    let occupied = match fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_some(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => return Err(e.into()),
    };
    if !occupied {
        return Ok(());
    }
    if !force {
        return Err(DeptraceError::Config(format!(
            "log directory {} already exists and is not empty; pass --force to overwrite it",
            dir.display()
        )));
    }
    log::warn!("Overwriting log directory {}", dir.display());
    fs::remove_dir_all(dir)?;
    Ok(())
}

/// Delete unnamed run directories under `base_dir` older than `max_age`
pub fn prune_stale_runs(base_dir: &Path, max_age: Duration) -> Result<usize> {
    let mut pruned = 0;
    let now = SystemTime::now();

    let entries = match fs::read_dir(base_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                log::warn!("Failed to read directory entry: {}", e);
                continue;
            }
        };

        let path = entry.path();
        let is_run = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| Uuid::parse_str(n).is_ok());
        if !path.is_dir() || !is_run {
            continue;
        }

        let age = match entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|modified| now.duration_since(modified))
        {
            Ok(Ok(age)) => age,
            // Unreadable or in the future
            _ => continue,
        };

        if age > max_age {
            log::debug!("Pruning stale run directory {}", path.display());
            match fs::remove_dir_all(&path) {
                Ok(()) => pruned += 1,
                Err(e) => log::warn!("Failed to prune {}: {}", path.display(), e),
            }
        }
    }

    Ok(pruned)
}
