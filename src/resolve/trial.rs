/// Trial execution and assessment
///
/// A trial materializes one CandidateSet (parent snapshot plus one
/// install), runs the command traced inside it, and hands the raw outcome
/// back to the engine. Sibling trials run as a window of scoped threads.
use crate::config::types::{DeptraceError, ExitStatus, FileAccessRecord, Result, TrialCommand};
use crate::index::{resolve_dot_dot, PackageIndex};
use crate::kernel::signal::CancelToken;
use crate::resolve::candidate::{CandidateSet, PackageCandidate};
use crate::resolve::node::{NodeId, TrialState};
use crate::sandbox::{SandboxProvider, SnapshotHandle};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Assessed outcome of one completed trial
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialResult {
    pub candidates: CandidateSet,
    pub exit: ExitStatus,
    pub records: Vec<FileAccessRecord>,
    /// Distinct missing paths, first-observed order
    pub missing_paths: Vec<String>,
    /// Missing paths some not-yet-installed package provides
    pub unexplained_paths: Vec<String>,
    /// Missing paths no further install can provide
    pub unresolvable_paths: Vec<String>,
    /// Packages to branch on, in exploration order
    pub next_candidates: Vec<PackageCandidate>,
    pub outcome: TrialState,
}

impl TrialResult {
    /// Sorted missing paths with repeats; two runs behave the same when
    /// these match
    pub fn missing_multiset(&self) -> Vec<String> {
        missing_multiset(&self.records)
    }

    pub fn improved(&self) -> bool {
        self.outcome == TrialState::Improved
    }
}

/// Distinct missing paths in first-observed order, `..` folded
pub fn missing_paths(records: &[FileAccessRecord]) -> Vec<String> {
    let mut seen = HashSet::new();
    records
        .iter()
        .filter(|r| !r.existed)
        .map(|r| resolve_dot_dot(&r.path))
        .filter(|p| seen.insert(p.clone()))
        .collect()
}

pub fn missing_multiset(records: &[FileAccessRecord]) -> Vec<String> {
    let mut paths: Vec<String> = records
        .iter()
        .filter(|r| !r.existed)
        .map(|r| resolve_dot_dot(&r.path))
        .collect();
    paths.sort_unstable();
    paths
}

/// How the missing paths of a trial split up against the index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assessment {
    pub unexplained_paths: Vec<String>,
    pub unresolvable_paths: Vec<String>,
    pub next_candidates: Vec<PackageCandidate>,
}

/// Offer every missing path to the index. Providers already in `installed`
/// do not count; packages are grouped in first-offered order.
pub fn assess(
    index: &dyn PackageIndex,
    installed: &CandidateSet,
    missing: &[String],
) -> Result<Assessment> {
    let mut assessment = Assessment::default();
    let mut slot: HashMap<String, usize> = HashMap::new();

    for path in missing {
        let providers = index.lookup(path).map_err(|e| match e {
            DeptraceError::IndexLookup { .. } => e,
            other => DeptraceError::IndexLookup {
                path: path.clone(),
                reason: other.to_string(),
            },
        })?;
        let fresh: Vec<String> = providers
            .into_iter()
            .filter(|p| !installed.contains(p))
            .collect();
        if fresh.is_empty() {
            assessment.unresolvable_paths.push(path.clone());
            continue;
        }
        assessment.unexplained_paths.push(path.clone());
        for package in fresh {
            match slot.get(&package) {
                Some(&i) => assessment.next_candidates[i].paths.push(path.clone()),
                None => {
                    slot.insert(package.clone(), assessment.next_candidates.len());
                    assessment.next_candidates.push(PackageCandidate {
                        package,
                        paths: vec![path.clone()],
                    });
                }
            }
        }
    }
    Ok(assessment)
}

enum CacheSlot {
    InFlight,
    Done(Arc<TrialResult>),
    Failed,
}

/// Content-keyed record of every CandidateSet the search has materialized
#[derive(Default)]
pub struct DedupCache {
    slots: Mutex<HashMap<CandidateSet, CacheSlot>>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<CandidateSet, CacheSlot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve `set` for a trial; false when it was already tried or is running
    pub fn claim(&self, set: &CandidateSet) -> bool {
        let mut slots = self.slots();
        if slots.contains_key(set) {
            return false;
        }
        slots.insert(set.clone(), CacheSlot::InFlight);
        true
    }

    pub fn complete(&self, set: &CandidateSet, result: Arc<TrialResult>) {
        self.slots().insert(set.clone(), CacheSlot::Done(result));
    }

    pub fn fail(&self, set: &CandidateSet) {
        self.slots().insert(set.clone(), CacheSlot::Failed);
    }

    /// Forget a cancelled trial so it may run again later
    pub fn release(&self, set: &CandidateSet) {
        self.slots().remove(set);
    }

    pub fn contains(&self, set: &CandidateSet) -> bool {
        self.slots().contains_key(set)
    }

    pub fn get(&self, set: &CandidateSet) -> Option<Arc<TrialResult>> {
        match self.slots().get(set) {
            Some(CacheSlot::Done(result)) => Some(Arc::clone(result)),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One trial to run: `package` installed over `base`, or `base` itself for
/// the root
#[derive(Debug, Clone)]
pub struct TrialJob {
    pub node: NodeId,
    pub candidates: CandidateSet,
    pub base: SnapshotHandle,
    pub package: Option<String>,
}

#[derive(Debug)]
pub enum TrialEnd {
    Completed {
        snapshot: SnapshotHandle,
        exit: ExitStatus,
        records: Vec<FileAccessRecord>,
    },
    Failed(DeptraceError),
    Cancelled,
}

pub struct TrialRunner<'a> {
    pub sandbox: &'a dyn SandboxProvider,
    pub command: &'a TrialCommand,
    pub cwd: &'a Path,
    pub timeout: Option<Duration>,
}

impl<'a> TrialRunner<'a> {
    /// Branch `base` and install `package` into the branch
    pub fn materialize(&self, base: &SnapshotHandle, package: &str) -> Result<SnapshotHandle> {
        let branch = self.sandbox.new_snapshot(Some(base))?;
        match self.sandbox.install(&branch, package) {
            Ok(installed) => {
                if installed.id != branch.id {
                    self.sandbox.discard(branch);
                }
                Ok(installed)
            }
            Err(e) => {
                self.sandbox.discard(branch);
                Err(e)
            }
        }
    }

    pub fn run_trial(&self, job: &TrialJob, cancel: &CancelToken) -> TrialEnd {
        let token = match self.timeout {
            Some(timeout) => cancel.clone().with_timeout(timeout),
            None => cancel.clone(),
        };
        if cancel.is_cancelled() {
            return TrialEnd::Cancelled;
        }

        let (snapshot, owned) = match &job.package {
            None => (job.base.clone(), false),
            Some(package) => match self.materialize(&job.base, package) {
                Ok(snapshot) => (snapshot, true),
                Err(e) => return TrialEnd::Failed(e),
            },
        };

        let outcome = self
            .sandbox
            .run(&snapshot, self.command, self.cwd, &token)
            .and_then(|run| Ok((run.exit, run.trace.into_records()?)));

        match outcome {
            Ok((exit, records)) => TrialEnd::Completed {
                snapshot,
                exit,
                records,
            },
            Err(e) => {
                if owned {
                    self.sandbox.discard(snapshot);
                }
                match e {
                    DeptraceError::Cancelled if token.deadline_passed() && !cancel.is_cancelled() => {
                        TrialEnd::Failed(DeptraceError::Sandbox(format!(
                            "trial with [{}] exceeded its {:?} time limit",
                            job.candidates,
                            self.timeout.unwrap_or_default()
                        )))
                    }
                    DeptraceError::Cancelled => TrialEnd::Cancelled,
                    other => TrialEnd::Failed(other),
                }
            }
        }
    }

    /// Run sibling trials concurrently, one scoped thread each.
    ///
    /// Results are consumed in sibling order. Once the successes among
    /// siblings `0..=i` reach `needed`, every sibling after `i` is
    /// cancelled. The returned ends line up with `jobs`.
    pub fn run_window<F>(
        &self,
        jobs: &[TrialJob],
        parent: &CancelToken,
        needed: Option<usize>,
        mut is_success: F,
    ) -> Vec<TrialEnd>
    where
        F: FnMut(usize, &TrialEnd) -> bool,
    {
        if jobs.len() == 1 {
            let end = self.run_trial(&jobs[0], &parent.child());
            is_success(0, &end);
            return vec![end];
        }

        let tokens: Vec<CancelToken> = jobs.iter().map(|_| parent.child()).collect();
        let mut ends: Vec<Option<TrialEnd>> = jobs.iter().map(|_| None).collect();
        let (tx, rx) = crossbeam_channel::unbounded::<(usize, TrialEnd)>();

        std::thread::scope(|scope| {
            for (idx, job) in jobs.iter().enumerate() {
                let tx = tx.clone();
                let token = tokens[idx].clone();
                scope.spawn(move || {
                    let end = self.run_trial(job, &token);
                    let _ = tx.send((idx, end));
                });
            }
            drop(tx);

            let mut consumed = 0;
            let mut successes = 0;
            let mut cut = false;
            for (idx, end) in rx.iter() {
                ends[idx] = Some(end);
                while !cut && consumed < ends.len() {
                    let Some(end) = ends[consumed].as_ref() else {
                        break;
                    };
                    if is_success(consumed, end) {
                        successes += 1;
                    }
                    consumed += 1;
                    if needed.is_some_and(|n| successes >= n) {
                        cut = true;
                        for token in &tokens[consumed..] {
                            token.cancel();
                        }
                    }
                }
            }
        });

        ends.into_iter()
            .map(|end| end.unwrap_or(TrialEnd::Cancelled))
            .collect()
    }
}
